use thiserror::Error;

/// Primary error type for the sqlexec virtual table module.
///
/// Variants follow the four failure families of the module: configuration
/// errors abort `CREATE VIRTUAL TABLE`, query errors carry the engine's
/// diagnostic, execution errors come out of stepping a cursor, and resource
/// errors mirror SQLite's `SQLITE_NOMEM`/`SQLITE_TOOBIG`.
#[derive(Error, Debug)]
pub enum SqlExecError {
    // === Configuration Errors ===
    /// The USING clause did not carry exactly one argument.
    #[error("sqlexec: expected 1 argument in USING clause, got {got}")]
    ArgumentCount { got: usize },

    /// The USING clause argument could not be used as query text.
    #[error("sqlexec: invalid USING clause argument: {detail}")]
    InvalidArgument { detail: String },

    /// The backing query produces no result columns.
    #[error("SQL statement returns no data: {sql}")]
    NoColumns { sql: String },

    /// The synthesized schema declaration was rejected.
    #[error("declaring virtual table failed for: {decl}; reason: {reason}")]
    DeclareSchema { decl: String, reason: String },

    /// The module name is already taken on this connection.
    #[error("Error declaring module {name} - maybe you are loading this extension twice?")]
    ModuleExists { name: String },

    // === Query Errors ===
    /// The backing query failed to compile.
    #[error("Error preparing: {sql}; reason: {reason}")]
    Prepare {
        sql: String,
        reason: String,
        code: i32,
    },

    // === Execution Errors ===
    /// Stepping the backing query returned neither a row nor completion.
    #[error("{message}")]
    Step { message: String, code: i32 },

    /// Finalizing a statement reported an error.
    #[error("finalizing statement failed for: {sql}; reason: {reason}")]
    Finalize {
        sql: String,
        reason: String,
        code: i32,
    },

    // === Resource Errors ===
    /// Out of memory.
    #[error("out of memory")]
    OutOfMemory,

    /// Query text too long for the engine.
    #[error("SQL statement too long: {length} bytes (max {max})")]
    TooBig { length: usize, max: usize },

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Error raised by the host connection outside the module callbacks.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite result codes the module reports back to the host.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Out of memory.
    NoMem = 7,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Library used incorrectly.
    Misuse = 21,
    /// `sqlite3_step()` has another row ready.
    Row = 100,
    /// `sqlite3_step()` has finished executing.
    Done = 101,
}

impl SqlExecError {
    /// Map this error to a primary SQLite result code.
    ///
    /// Errors that came from the engine keep the engine's primary code even
    /// when it is not one of the [`ErrorCode`] variants; see
    /// [`Self::sqlite_code`].
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::ArgumentCount { .. }
            | Self::InvalidArgument { .. }
            | Self::NoColumns { .. }
            | Self::DeclareSchema { .. }
            | Self::Prepare { .. }
            | Self::Step { .. }
            | Self::Finalize { .. }
            | Self::Sqlite(_) => ErrorCode::Error,
            Self::ModuleExists { .. } => ErrorCode::Misuse,
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::TooBig { .. } => ErrorCode::TooBig,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The extended SQLite result code reported to the host.
    pub fn sqlite_code(&self) -> i32 {
        match self {
            Self::Prepare { code, .. } | Self::Step { code, .. } | Self::Finalize { code, .. } => {
                *code
            }
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => err.extended_code,
            _ => self.error_code() as i32,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }
}

impl From<SqlExecError> for rusqlite::Error {
    /// Convert into the host's error type.
    ///
    /// Engine failures keep their extended code so SQLite reports the same
    /// status it would for the statement itself; the message is attached
    /// verbatim.
    fn from(err: SqlExecError) -> Self {
        match err {
            SqlExecError::Sqlite(inner) => inner,
            SqlExecError::Prepare { .. }
            | SqlExecError::Step { .. }
            | SqlExecError::Finalize { .. }
            | SqlExecError::OutOfMemory
            | SqlExecError::TooBig { .. }
            | SqlExecError::Internal(_) => {
                let code = err.sqlite_code();
                Self::SqliteFailure(rusqlite::ffi::Error::new(code), Some(err.to_string()))
            }
            other => Self::ModuleError(other.to_string()),
        }
    }
}

/// Result type alias using `SqlExecError`.
pub type Result<T> = std::result::Result<T, SqlExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_argument_count() {
        let err = SqlExecError::ArgumentCount { got: 3 };
        assert_eq!(
            err.to_string(),
            "sqlexec: expected 1 argument in USING clause, got 3"
        );
    }

    #[test]
    fn error_display_prepare_quotes_sql_and_reason() {
        let err = SqlExecError::Prepare {
            sql: "selec 1".to_owned(),
            reason: r#"near "selec": syntax error"#.to_owned(),
            code: 1,
        };
        assert_eq!(
            err.to_string(),
            r#"Error preparing: selec 1; reason: near "selec": syntax error"#
        );
    }

    #[test]
    fn error_display_no_columns() {
        let err = SqlExecError::NoColumns {
            sql: "create table t(a)".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "SQL statement returns no data: create table t(a)"
        );
    }

    #[test]
    fn error_display_step_is_verbatim() {
        let err = SqlExecError::Step {
            message: "integer overflow".to_owned(),
            code: 1,
        };
        assert_eq!(err.to_string(), "integer overflow");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            SqlExecError::ArgumentCount { got: 0 }.error_code(),
            ErrorCode::Error
        );
        assert_eq!(
            SqlExecError::ModuleExists {
                name: "sqlexec".to_owned()
            }
            .error_code(),
            ErrorCode::Misuse
        );
        assert_eq!(SqlExecError::OutOfMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(
            SqlExecError::internal("bad plan").error_code(),
            ErrorCode::Internal
        );
        assert_eq!(
            SqlExecError::TooBig { length: 1, max: 0 }.error_code(),
            ErrorCode::TooBig
        );
    }

    #[test]
    fn sqlite_code_keeps_engine_extended_code() {
        // SQLITE_CONSTRAINT_CHECK
        let err = SqlExecError::Step {
            message: "CHECK constraint failed".to_owned(),
            code: 275,
        };
        assert_eq!(err.sqlite_code(), 275);
        assert_eq!(SqlExecError::OutOfMemory.sqlite_code(), 7);
    }

    #[test]
    fn into_rusqlite_engine_failure_keeps_code_and_message() {
        let err: rusqlite::Error = SqlExecError::Prepare {
            sql: "select * from missing".to_owned(),
            reason: "no such table: missing".to_owned(),
            code: 1,
        }
        .into();
        match err {
            rusqlite::Error::SqliteFailure(inner, Some(message)) => {
                assert_eq!(inner.extended_code, 1);
                assert!(message.contains("no such table: missing"));
                assert!(message.contains("select * from missing"));
            }
            other => panic!("unexpected conversion: {other:?}"),
        }
    }

    #[test]
    fn into_rusqlite_internal_uses_internal_code() {
        let err: rusqlite::Error = SqlExecError::internal("unexpected plan 7").into();
        assert!(matches!(
            err,
            rusqlite::Error::SqliteFailure(inner, _) if inner.extended_code == 2
        ));
    }

    #[test]
    fn into_rusqlite_configuration_is_module_error() {
        let err: rusqlite::Error = SqlExecError::ArgumentCount { got: 2 }.into();
        assert!(matches!(
            err,
            rusqlite::Error::ModuleError(message) if message.contains("got 2")
        ));
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Error as i32, 1);
        assert_eq!(ErrorCode::Internal as i32, 2);
        assert_eq!(ErrorCode::NoMem as i32, 7);
        assert_eq!(ErrorCode::Row as i32, 100);
        assert_eq!(ErrorCode::Done as i32, 101);
    }
}
