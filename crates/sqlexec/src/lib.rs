//! SQL-defined virtual tables for SQLite.
//!
//! The `sqlexec` module turns any row-producing statement into a table:
//!
//! ```text
//! sqlite> create virtual table dblist using sqlexec(pragma database_list);
//! sqlite> select * from dblist;
//! seq|name|file
//! 0|main|
//! ```
//!
//! This is mostly useful for statements that cannot appear inside views or
//! joins, such as `PRAGMA`. SQL containing commas must be wrapped in an
//! extra pair of parentheses so SQLite does not split it into several
//! module arguments: `using sqlexec((select a, b from t))`.
//!
//! The table is read-only, offers no index (every constraint is evaluated
//! by SQLite after the rows are produced), and each scan re-executes the
//! backing query from scratch. Column names are those of the backing
//! query's result columns; rowids are the 1-based position of a row within
//! its scan.

pub mod args;
pub mod cursor;
pub mod schema;
mod stmt;
pub mod table;

use rusqlite::Connection;
use rusqlite::vtab::read_only_module;
use tracing::{debug, info};

pub use cursor::SqlExecCursor;
pub use sqlexec_error::{ErrorCode, Result, SqlExecError};
pub use table::SqlExecTable;

/// Name the module is registered under.
pub const MODULE_NAME: &str = "sqlexec";

/// Register the `sqlexec` module on `conn`.
///
/// # Errors
///
/// [`SqlExecError::ModuleExists`] if a module named `sqlexec` is already
/// registered on this connection; [`SqlExecError::Sqlite`] if the engine
/// rejects the registration.
pub fn register(conn: &Connection) -> Result<()> {
    if is_registered(conn)? {
        return Err(SqlExecError::ModuleExists {
            name: MODULE_NAME.to_owned(),
        });
    }
    conn.create_module(MODULE_NAME, read_only_module::<SqlExecTable>(), None)?;
    info!(module = MODULE_NAME, "sqlexec: module registered");
    Ok(())
}

/// Whether a module named `sqlexec` is registered on `conn`.
///
/// SQLite silently replaces a module registered twice, so the check reads
/// the connection's module list instead of relying on `create_module`. The
/// query is read-only and works on `query_only` connections.
///
/// # Errors
///
/// [`SqlExecError::Sqlite`] if the module list cannot be queried.
pub fn is_registered(conn: &Connection) -> Result<bool> {
    let mut stmt = conn.prepare("select 1 from pragma_module_list where name = ?1")?;
    let registered = stmt.exists([MODULE_NAME])?;
    if registered {
        debug!(module = MODULE_NAME, "sqlexec: module already registered");
    }
    Ok(registered)
}
