use std::ffi::OsString;
use std::io::{self, BufRead, ErrorKind, Write};

use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = ":memory:";
const PROMPT_PRIMARY: &str = "sqlexec> ";
const PROMPT_CONTINUATION: &str = "   ...> ";
const LOG_ENV: &str = "SQLEXEC_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    db_path: String,
    command: Option<String>,
    headers: bool,
    show_help: bool,
}

/// An open database plus the shell settings that affect output.
struct Session {
    connection: Connection,
    headers: bool,
}

fn main() {
    init_tracing();

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    let exit_code = run(std::env::args_os(), &mut input, &mut stdout, &mut stderr);
    drop(input);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run<I, R, W, E>(args: I, input: &mut R, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    R: BufRead,
    W: Write,
    E: Write,
{
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = write_usage(err);
            return 2;
        }
    };

    if options.show_help {
        if write_usage(out).is_err() {
            return 1;
        }
        return 0;
    }

    let mut session = match open_session(&options) {
        Ok(session) => session,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            return 1;
        }
    };

    if let Some(command) = options.command.as_deref() {
        return run_command(&session, command, out, err);
    }

    run_repl(&mut session, input, out, err)
}

fn open_session(options: &CliOptions) -> Result<Session, String> {
    let connection = Connection::open(&options.db_path).map_err(|e| e.to_string())?;
    sqlexec::register(&connection).map_err(|e| e.to_string())?;
    info!(db = %options.db_path, "shell: database opened");
    Ok(Session {
        connection,
        headers: options.headers,
    })
}

fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut iter = args.into_iter();
    let _argv0 = iter.next();

    let mut db_path = String::from(DEFAULT_DB_PATH);
    let mut has_path = false;
    let mut command: Option<String> = None;
    let mut headers = false;
    let mut show_help = false;

    while let Some(argument) = iter.next() {
        let arg = argument.to_string_lossy();
        let arg_str = arg.as_ref();

        match arg_str {
            "-h" | "--help" => {
                show_help = true;
            }
            "--header" => {
                headers = true;
            }
            "-c" | "--command" => {
                if command.is_some() {
                    return Err(String::from("`-c/--command` may only be provided once"));
                }
                let next = iter
                    .next()
                    .ok_or_else(|| String::from("missing SQL argument for `-c/--command`"))?;
                command = Some(next.to_string_lossy().into_owned());
            }
            _ => {
                if let Some(value) = arg_str
                    .strip_prefix("-c=")
                    .or_else(|| arg_str.strip_prefix("--command="))
                {
                    if command.is_some() {
                        return Err(String::from("`-c/--command` may only be provided once"));
                    }
                    command = Some(value.to_owned());
                    continue;
                }

                if arg_str.starts_with('-') {
                    return Err(format!("unknown option `{arg_str}`"));
                }

                if has_path {
                    return Err(String::from(
                        "too many positional arguments; expected at most one DB path",
                    ));
                }

                arg_str.clone_into(&mut db_path);
                has_path = true;
            }
        }
    }

    Ok(CliOptions {
        db_path,
        command,
        headers,
        show_help,
    })
}

fn run_command<W, E>(session: &Session, command: &str, out: &mut W, err: &mut E) -> i32
where
    W: Write,
    E: Write,
{
    i32::from(!execute_sql(session, command, out, err))
}

fn run_repl<R, W, E>(session: &mut Session, input: &mut R, out: &mut W, err: &mut E) -> i32
where
    R: BufRead,
    W: Write,
    E: Write,
{
    let mut pending_sql = String::new();
    let mut line_buffer = String::new();

    loop {
        let prompt = if pending_sql.trim().is_empty() {
            PROMPT_PRIMARY
        } else {
            PROMPT_CONTINUATION
        };

        if write!(out, "{prompt}").and_then(|()| out.flush()).is_err() {
            return 1;
        }

        line_buffer.clear();
        let bytes_read = match input.read_line(&mut line_buffer) {
            Ok(bytes_read) => bytes_read,
            Err(error) if error.kind() == ErrorKind::Interrupted => {
                // An interrupt abandons the statement being typed.
                pending_sql.clear();
                let _ = writeln!(out);
                continue;
            }
            Err(error) => {
                let _ = writeln!(err, "error: {error}");
                return 1;
            }
        };

        if bytes_read == 0 {
            if !pending_sql.trim().is_empty() {
                let _ = execute_sql(session, pending_sql.trim(), out, err);
            }
            return 0;
        }

        let line = line_buffer.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim();

        if pending_sql.trim().is_empty() {
            if matches!(trimmed, ".exit" | ".quit") {
                return 0;
            }

            if trimmed == ".help" {
                if write_repl_help(out).is_err() {
                    return 1;
                }
                continue;
            }

            if try_execute_read_command(trimmed, session, out, err)
                || try_execute_headers_command(trimmed, session, err)
            {
                continue;
            }

            if trimmed.starts_with('.') {
                let _ = writeln!(
                    err,
                    "error: unknown command or invalid arguments: \"{}\". Enter \".help\" for help",
                    trimmed.trim_start_matches('.')
                );
                continue;
            }

            if trimmed.is_empty() {
                continue;
            }
        }

        if !pending_sql.is_empty() {
            pending_sql.push('\n');
        }
        pending_sql.push_str(line);

        if statement_complete(&pending_sql) {
            let _ = execute_sql(session, pending_sql.trim(), out, err);
            pending_sql.clear();
        }
    }
}

/// Run every statement in `sql` in order, printing result rows.
///
/// Stops at the first failing statement. Returns whether all of them
/// succeeded.
fn execute_sql<W, E>(session: &Session, sql: &str, out: &mut W, err: &mut E) -> bool
where
    W: Write,
    E: Write,
{
    match execute_batch(session, sql, out) {
        Ok(()) => true,
        Err(ShellError::Sql(error)) => {
            let _ = writeln!(err, "error: {error}");
            false
        }
        Err(ShellError::Io(error)) => {
            let _ = writeln!(err, "error: failed writing query results: {error}");
            false
        }
    }
}

enum ShellError {
    Sql(rusqlite::Error),
    Io(io::Error),
}

impl From<rusqlite::Error> for ShellError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Sql(error)
    }
}

impl From<io::Error> for ShellError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

fn execute_batch<W>(session: &Session, sql: &str, out: &mut W) -> Result<(), ShellError>
where
    W: Write,
{
    let mut batch = Batch::new(&session.connection, sql);
    while let Some(mut stmt) = batch.next()? {
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let width = column_names.len();
        debug!(columns = width, "shell: executing statement");

        let mut rows = stmt.query([])?;
        let mut wrote_header = false;
        while let Some(row) = rows.next()? {
            if session.headers && !wrote_header {
                writeln!(out, "{}", column_names.join("|"))?;
                wrote_header = true;
            }
            let values = (0..width)
                .map(|i| row.get_ref(i).map(format_value))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            writeln!(out, "{}", values.join("|"))?;
        }
    }
    Ok(())
}

fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.1}"),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementScanState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    BracketIdent,
    LineComment,
    BlockComment,
}

impl StatementScanState {
    const fn is_unterminated(self) -> bool {
        matches!(
            self,
            Self::SingleQuote
                | Self::DoubleQuote
                | Self::Backtick
                | Self::BracketIdent
                | Self::BlockComment
        )
    }

    /// Closing byte of a quoted region, if this state is one.
    const fn closing_quote(self) -> Option<u8> {
        match self {
            Self::SingleQuote => Some(b'\''),
            Self::DoubleQuote => Some(b'"'),
            Self::Backtick => Some(b'`'),
            Self::BracketIdent => Some(b']'),
            Self::Normal | Self::LineComment | Self::BlockComment => None,
        }
    }
}

fn is_line_comment_start(bytes: &[u8], i: usize) -> bool {
    if bytes.get(i) != Some(&b'-') || bytes.get(i + 1) != Some(&b'-') {
        return false;
    }
    // `--` opens a comment only before whitespace or end of input.
    match bytes.get(i + 2) {
        None => true,
        Some(byte) => byte.is_ascii_whitespace(),
    }
}

fn is_block_comment_start(bytes: &[u8], i: usize) -> bool {
    bytes.get(i) == Some(&b'/') && bytes.get(i + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], i: usize) -> bool {
    bytes.get(i) == Some(&b'*') && bytes.get(i + 1) == Some(&b'/')
}

/// Whether `buffer` ends with a `;` outside any quote or comment.
fn statement_complete(buffer: &str) -> bool {
    let bytes = buffer.as_bytes();
    let mut state = StatementScanState::Normal;
    let mut last_significant: Option<u8> = None;

    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            StatementScanState::Normal => {
                if b.is_ascii_whitespace() {
                    i += 1;
                    continue;
                }
                if is_line_comment_start(bytes, i) {
                    state = StatementScanState::LineComment;
                    i += 2;
                    continue;
                }
                if is_block_comment_start(bytes, i) {
                    state = StatementScanState::BlockComment;
                    i += 2;
                    continue;
                }

                last_significant = Some(b);
                state = match b {
                    b'\'' => StatementScanState::SingleQuote,
                    b'"' => StatementScanState::DoubleQuote,
                    b'`' => StatementScanState::Backtick,
                    b'[' => StatementScanState::BracketIdent,
                    _ => StatementScanState::Normal,
                };
                i += 1;
            }
            StatementScanState::SingleQuote
            | StatementScanState::DoubleQuote
            | StatementScanState::Backtick
            | StatementScanState::BracketIdent => {
                if Some(b) == state.closing_quote() {
                    // A doubled closing quote is an escaped literal quote.
                    if bytes.get(i + 1) == Some(&b) {
                        i += 2;
                    } else {
                        state = StatementScanState::Normal;
                        i += 1;
                    }
                } else {
                    i += 1;
                }
            }
            StatementScanState::LineComment => {
                if b == b'\n' || b == b'\r' {
                    state = StatementScanState::Normal;
                }
                i += 1;
            }
            StatementScanState::BlockComment => {
                if is_block_comment_end(bytes, i) {
                    state = StatementScanState::Normal;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
    }

    !state.is_unterminated() && last_significant == Some(b';')
}

/// Split a dot command into its name and the rest of the line.
///
/// `None` unless `trimmed` is exactly `name` or `name` followed by
/// whitespace.
fn dot_command_argument<'a>(trimmed: &'a str, name: &str) -> Option<&'a str> {
    let rest = trimmed.strip_prefix(name)?;
    match rest.chars().next() {
        Some(first_char) if !first_char.is_whitespace() => None,
        _ => Some(rest.trim()),
    }
}

fn try_execute_read_command<W, E>(
    trimmed: &str,
    session: &Session,
    out: &mut W,
    err: &mut E,
) -> bool
where
    W: Write,
    E: Write,
{
    let Some(path) = dot_command_argument(trimmed, ".read") else {
        return false;
    };

    if path.is_empty() {
        let _ = writeln!(err, "error: .read requires a file path");
        return true;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let _ = execute_sql(session, &contents, out, err);
        }
        Err(error) => {
            let _ = writeln!(err, "error: cannot read `{path}`: {error}");
        }
    }

    true
}

fn try_execute_headers_command<E>(trimmed: &str, session: &mut Session, err: &mut E) -> bool
where
    E: Write,
{
    let Some(setting) = dot_command_argument(trimmed, ".headers") else {
        return false;
    };

    match setting.to_ascii_lowercase().as_str() {
        "on" | "yes" | "1" => session.headers = true,
        "off" | "no" | "0" => session.headers = false,
        _ => {
            let _ = writeln!(err, "error: usage: .headers on|off");
        }
    }

    true
}

fn write_usage<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "Usage: sqlexec [DB_PATH] [-c|--command SQL] [--header]\n\
         \n\
         Opens DB_PATH (default :memory:) with the sqlexec virtual table module\n\
         registered. Set {LOG_ENV} to a tracing filter (e.g. `debug`) for logs.\n\
         \n\
         Examples:\n\
         \n\
         sqlexec\n\
         sqlexec app.db\n\
         sqlexec -c \"CREATE VIRTUAL TABLE dbs USING sqlexec(PRAGMA database_list); SELECT * FROM dbs;\"\n\
         sqlexec app.db --header --command \"SELECT * FROM users;\"\n",
    )
}

fn write_repl_help<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "Dot commands:\n\
         \n\
         .headers on|off  Turn display of column names on or off\n\
         .help            Show this help\n\
         .quit            Exit the shell\n\
         .exit            Exit the shell\n\
         .read FILE       Execute SQL from file\n\
         \n\
         Enter SQL statements terminated by `;`.\n",
    )
}
