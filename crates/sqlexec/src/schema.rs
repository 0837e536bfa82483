//! Schema derivation for a backing query.
//!
//! The query is compiled once at `CREATE`/`CONNECT` time to validate it and
//! read its result column names; the statement is then finalized; cursors
//! prepare their own.

#![allow(unsafe_code)]

use std::collections::HashSet;

use rusqlite::ffi;
use rusqlite::vtab::escape_double_quote;
use sqlexec_error::{Result, SqlExecError};

use crate::stmt::PreparedStatement;

/// Columns of a backing query and the matching `CREATE TABLE` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedSchema {
    /// Result column names, in result order.
    pub columns: Vec<String>,
    /// Declaration handed to `sqlite3_declare_vtab`.
    pub declaration: String,
}

/// Compile `sql` on `db` and derive the virtual table schema from its result
/// columns.
///
/// # Errors
///
/// - [`SqlExecError::Prepare`] if the query does not compile;
/// - [`SqlExecError::NoColumns`] if it holds no statement or the statement
///   returns no columns;
/// - [`SqlExecError::DeclareSchema`] if the column names cannot form a table;
/// - [`SqlExecError::Finalize`] if releasing the validating statement fails.
///
/// # Safety
///
/// `db` must be an open connection.
pub(crate) unsafe fn derive(db: *mut ffi::sqlite3, sql: &str) -> Result<DerivedSchema> {
    // SAFETY: forwarded from the caller; the statement is dropped or
    // finalized before this function returns.
    let Some(stmt) = (unsafe { PreparedStatement::prepare(db, sql)? }) else {
        return Err(SqlExecError::NoColumns {
            sql: sql.to_owned(),
        });
    };

    let count = stmt.column_count();
    if count == 0 {
        return Err(SqlExecError::NoColumns {
            sql: sql.to_owned(),
        });
    }

    let columns = (0..count)
        .map(|col| stmt.column_name(col))
        .collect::<Result<Vec<_>>>()?;
    stmt.finalize(sql)?;

    let declaration = declaration_for(&columns)?;
    Ok(DerivedSchema {
        columns,
        declaration,
    })
}

/// Build `create table x("c1","c2",...)` for the given column names.
///
/// Names are compared the way SQLite compares column names (ASCII
/// case-insensitively); a repeated name would be rejected by the engine, so
/// it is reported here with the declaration attached.
///
/// # Errors
///
/// [`SqlExecError::DeclareSchema`] on a duplicate column name.
pub fn declaration_for(columns: &[String]) -> Result<String> {
    let quoted: Vec<String> = columns.iter().map(|name| quote_identifier(name)).collect();
    let declaration = format!("create table x({})", quoted.join(","));

    let mut seen = HashSet::with_capacity(columns.len());
    for name in columns {
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(SqlExecError::DeclareSchema {
                decl: declaration,
                reason: format!("duplicate column name: {name}"),
            });
        }
    }

    Ok(declaration)
}

/// Quote `name` as an SQL identifier.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", escape_double_quote(name))
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    fn names(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|&c| c.to_owned()).collect()
    }

    fn derive_on(conn: &Connection, sql: &str) -> Result<DerivedSchema> {
        // SAFETY: `conn` stays open for the duration of the call.
        unsafe { derive(conn.handle(), sql) }
    }

    #[test]
    fn test_declaration_preserves_order() {
        let decl = declaration_for(&names(&["seq", "name", "file"])).unwrap();
        assert_eq!(decl, r#"create table x("seq","name","file")"#);
    }

    #[test]
    fn test_declaration_escapes_quotes() {
        let decl = declaration_for(&names(&[r#"say "hi""#, "it's"])).unwrap();
        assert_eq!(decl, r#"create table x("say ""hi""","it's")"#);
    }

    #[test]
    fn test_quote_identifier_doubles_embedded_quotes() {
        assert_eq!(quote_identifier("plain"), r#""plain""#);
        assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_identifier(""), r#""""#);
    }

    #[test]
    fn test_declaration_rejects_duplicates_case_insensitively() {
        let err = declaration_for(&names(&["id", "ID"])).unwrap_err();
        match err {
            SqlExecError::DeclareSchema { decl, reason } => {
                assert_eq!(decl, r#"create table x("id","ID")"#);
                assert_eq!(reason, "duplicate column name: ID");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_derive_from_pragma() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = derive_on(&conn, "pragma database_list").unwrap();
        assert_eq!(schema.columns, names(&["seq", "name", "file"]));
        assert_eq!(
            schema.declaration,
            r#"create table x("seq","name","file")"#
        );
    }

    #[test]
    fn test_derive_uses_display_names() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = derive_on(&conn, "select 1, 'main' as name, ''").unwrap();
        assert_eq!(schema.columns, names(&["1", "name", "''"]));
    }

    #[test]
    fn test_derive_rejects_statement_without_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let err = derive_on(&conn, "create table t(a)").unwrap_err();
        assert!(matches!(err, SqlExecError::NoColumns { sql } if sql == "create table t(a)"));
        // Only compiled, never executed.
        let exists: i64 = conn
            .query_row(
                "select count(*) from sqlite_schema where name = 't'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
    }

    #[test]
    fn test_derive_rejects_empty_query() {
        let conn = Connection::open_in_memory().unwrap();
        let err = derive_on(&conn, "  ").unwrap_err();
        assert!(matches!(err, SqlExecError::NoColumns { .. }));
    }

    #[test]
    fn test_derive_reports_prepare_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let err = derive_on(&conn, "selec 1").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Error preparing: selec 1; reason: "), "{message}");
        assert!(message.contains("syntax error"), "{message}");
    }
}
