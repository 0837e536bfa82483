//! The `sqlexec` virtual table.

#![allow(unsafe_code)]

use std::rc::Rc;

use rusqlite::ffi;
use rusqlite::vtab::{CreateVTab, IndexInfo, VTab, VTabConnection, VTabKind, sqlite3_vtab};
use sqlexec_error::Result;
use tracing::debug;

use crate::args;
use crate::cursor::SqlExecCursor;
use crate::schema::{self, DerivedSchema};

/// The only query plan this table offers: a full, unordered scan.
pub const FULL_SCAN_PLAN: i32 = 0;

/// Estimated cost reported for the full scan.
pub const FULL_SCAN_COST: f64 = 2_147_483_647.0;

/// Estimated row count reported for the full scan.
pub const FULL_SCAN_ROWS: i64 = 2_147_483_647;

/// A virtual table whose rows are the result rows of a fixed SQL query.
///
/// The table is fully described by its `CREATE VIRTUAL TABLE` arguments, so
/// `CREATE` and `CONNECT` do the same work. It holds no per-scan state:
/// every cursor re-executes the query on its own statement.
#[repr(C)]
pub struct SqlExecTable {
    /// Base class. Must be first.
    base: sqlite3_vtab,
    /// Connection that owns this table. Borrowed from the host.
    db: *mut ffi::sqlite3,
    sql: Rc<str>,
}

impl SqlExecTable {
    /// Build a table from raw module arguments.
    ///
    /// Returns the schema declaration alongside the table.
    ///
    /// # Safety
    ///
    /// `db` must be an open connection that outlives the table.
    pub(crate) unsafe fn from_module_args(
        db: *mut ffi::sqlite3,
        args: &[&[u8]],
    ) -> Result<(DerivedSchema, Self)> {
        let sql = args::query_from_module_args(args)?;
        // SAFETY: forwarded from the caller.
        let schema = unsafe { schema::derive(db, &sql)? };

        let table_name = args
            .get(2)
            .map(|name| String::from_utf8_lossy(name))
            .unwrap_or_default();
        debug!(
            table = %table_name,
            sql = %sql,
            columns = schema.columns.len(),
            "sqlexec: table connected"
        );

        Ok((
            schema,
            Self {
                base: sqlite3_vtab::default(),
                db,
                sql: Rc::from(sql),
            },
        ))
    }

    /// The normalized backing query.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Open a cursor on this table.
    ///
    /// # Errors
    ///
    /// [`sqlexec_error::SqlExecError::Prepare`] if the backing query no
    /// longer compiles.
    pub fn open_cursor<'vtab>(&self) -> Result<SqlExecCursor<'vtab>> {
        // SAFETY: `db` outlives the table, and cursors never outlive the
        // table that opened them.
        unsafe { SqlExecCursor::open(self.db, Rc::clone(&self.sql)) }
    }
}

unsafe impl<'vtab> VTab<'vtab> for SqlExecTable {
    type Aux = ();
    type Cursor = SqlExecCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        _aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        // SAFETY: the host hands us its own open connection for the duration
        // of the table's life.
        let (schema, table) = unsafe { Self::from_module_args(db.handle(), args)? };
        Ok((schema.declaration, table))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        // No constraint is consumed, so the engine filters every row itself.
        info.set_idx_num(FULL_SCAN_PLAN);
        info.set_estimated_cost(FULL_SCAN_COST);
        info.set_estimated_rows(FULL_SCAN_ROWS);
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<SqlExecCursor<'vtab>> {
        Ok(self.open_cursor()?)
    }
}

impl CreateVTab<'_> for SqlExecTable {
    const KIND: VTabKind = VTabKind::Default;
}
