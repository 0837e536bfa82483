//! USING clause handling.
//!
//! SQLite splits the USING clause on top-level commas, so SQL containing a
//! comma has to be wrapped in an extra pair of parentheses. The normalizer
//! strips that optional wrapper:
//!
//! ```text
//! USING sqlexec(pragma database_list)          -> pragma database_list
//! USING sqlexec((select name, file from x))    -> select name, file from x
//! ```

use sqlexec_error::{Result, SqlExecError};

/// Arguments SQLite passes ahead of the USING clause: module name, database
/// name, table name.
pub const HOST_ARG_COUNT: usize = 3;

/// Extract the backing query from the raw module arguments of
/// `CREATE VIRTUAL TABLE`.
///
/// Exactly one USING argument must be present.
///
/// # Errors
///
/// [`SqlExecError::ArgumentCount`] for any other number of arguments,
/// [`SqlExecError::InvalidArgument`] if the argument is not UTF-8.
pub fn query_from_module_args(args: &[&[u8]]) -> Result<String> {
    let using = args.get(HOST_ARG_COUNT..).unwrap_or_default();
    let [arg] = using else {
        return Err(SqlExecError::ArgumentCount { got: using.len() });
    };
    let arg = std::str::from_utf8(arg).map_err(|err| {
        SqlExecError::invalid_argument(format!("USING clause argument is not UTF-8: {err}"))
    })?;
    Ok(normalize(arg).to_owned())
}

/// Strip an optional enclosing parenthesis pair from `arg`.
///
/// The wrapper is recognized only when nothing but whitespace precedes the
/// first `(` and nothing but whitespace follows the last `)`; the result is
/// everything strictly between them. In every other case `arg` is returned
/// unchanged. This is a textual check: parentheses inside the query are not
/// balanced against each other.
#[must_use]
pub fn normalize(arg: &str) -> &str {
    let Some(open) = arg.find('(') else {
        return arg;
    };
    if !arg.as_bytes()[..open].iter().copied().all(is_c_space) {
        return arg;
    }
    let Some(close) = arg.rfind(')') else {
        return arg;
    };
    if !arg.as_bytes()[close + 1..].iter().copied().all(is_c_space) {
        return arg;
    }
    &arg[open + 1..close]
}

/// Whitespace as classified by C `isspace` in the "C" locale.
const fn is_c_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}
