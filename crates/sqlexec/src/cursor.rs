//! Cursor over the rows of a backing query.
//!
//! Each cursor prepares its own execution of the query and steps it one row
//! at a time. The state is explicit:
//!
//! ```text
//!   open ──► Active(stmt) ──step: ROW──► Active(stmt), rowid += 1
//!                 │
//!                 └──────────step: DONE──► Exhausted (stmt finalized)
//! ```
//!
//! `Exhausted` absorbs further advances. Starting a new scan on a cursor
//! that already scanned (the inner side of a nested-loop join) re-prepares
//! the query.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::rc::Rc;

use rusqlite::ffi;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::vtab::{Context, Filters, VTabCursor, sqlite3_vtab_cursor};
use sqlexec_error::{Result, SqlExecError};
use tracing::debug;

use crate::stmt::{PreparedStatement, StepResult};
use crate::table::{FULL_SCAN_PLAN, SqlExecTable};

enum ScanState {
    /// Holds the live statement; positioned on the current row once the
    /// scan has started.
    Active(PreparedStatement),
    /// End of data. No statement is held.
    Exhausted,
}

/// Cursor for one scan (or a sequence of scans) of a [`SqlExecTable`].
#[repr(C)]
pub struct SqlExecCursor<'vtab> {
    /// Base class. Must be first.
    base: sqlite3_vtab_cursor,
    db: *mut ffi::sqlite3,
    sql: Rc<str>,
    state: ScanState,
    row_id: i64,
    scan_started: bool,
    phantom: PhantomData<&'vtab SqlExecTable>,
}

impl SqlExecCursor<'_> {
    /// Prepare a fresh execution of `sql`.
    ///
    /// # Safety
    ///
    /// `db` must be an open connection that outlives the cursor.
    pub(crate) unsafe fn open(db: *mut ffi::sqlite3, sql: Rc<str>) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let state = unsafe { prepare_scan(db, &sql)? };
        debug!(sql = %sql, "sqlexec: cursor opened");
        Ok(Self {
            base: sqlite3_vtab_cursor::default(),
            db,
            sql,
            state,
            row_id: 0,
            scan_started: false,
            phantom: PhantomData,
        })
    }

    /// Begin a scan with the plan chosen by `best_index` and position the
    /// cursor on the first row.
    ///
    /// # Errors
    ///
    /// [`SqlExecError::Internal`] for any plan other than
    /// [`FULL_SCAN_PLAN`]; otherwise whatever [`advance`](Self::advance)
    /// or re-preparing the query reports.
    pub fn start_scan(&mut self, idx_num: i32) -> Result<()> {
        if idx_num != FULL_SCAN_PLAN {
            return Err(SqlExecError::internal(format!(
                "sqlexec: unexpected query plan {idx_num}"
            )));
        }
        if self.scan_started {
            // Release the old statement before compiling its replacement.
            self.state = ScanState::Exhausted;
            // SAFETY: `db` outlives the cursor per `open`'s contract.
            self.state = unsafe { prepare_scan(self.db, &self.sql)? };
            self.row_id = 0;
            debug!(sql = %self.sql, "sqlexec: cursor rescan");
        }
        self.scan_started = true;
        self.advance()
    }

    /// Move to the next row.
    ///
    /// A no-op once the cursor is exhausted. On end of data the statement is
    /// finalized and the cursor becomes exhausted even if finalizing fails.
    ///
    /// # Errors
    ///
    /// [`SqlExecError::Step`] when the query fails mid-scan (the statement is
    /// kept until the cursor is closed), [`SqlExecError::Finalize`] when
    /// releasing it at end of data fails.
    pub fn advance(&mut self) -> Result<()> {
        let step = match &mut self.state {
            ScanState::Exhausted => return Ok(()),
            ScanState::Active(stmt) => stmt.step()?,
        };
        match step {
            StepResult::Row => {
                self.row_id += 1;
                Ok(())
            }
            StepResult::Done => {
                debug!(rows = self.row_id, "sqlexec: end of data");
                match std::mem::replace(&mut self.state, ScanState::Exhausted) {
                    ScanState::Active(stmt) => stmt.finalize(&self.sql),
                    ScanState::Exhausted => Ok(()),
                }
            }
        }
    }

    /// Whether the cursor has moved past the last row.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, ScanState::Exhausted)
    }

    /// Synthetic rowid of the current row: its 1-based position in the scan.
    #[must_use]
    pub fn row_id(&self) -> i64 {
        self.row_id
    }

    /// Value of column `col` in the current row.
    ///
    /// The value borrows the statement's row buffer and is invalidated by
    /// the next advance.
    ///
    /// # Errors
    ///
    /// [`SqlExecError::Internal`] when the cursor is exhausted.
    pub fn value(&self, col: c_int) -> Result<ValueRef<'_>> {
        match &self.state {
            ScanState::Active(stmt) => stmt.value_ref(col),
            ScanState::Exhausted => Err(SqlExecError::internal(format!(
                "sqlexec: column {col} read past end of data"
            ))),
        }
    }
}

/// # Safety
///
/// `db` must be an open connection that outlives the returned state.
unsafe fn prepare_scan(db: *mut ffi::sqlite3, sql: &str) -> Result<ScanState> {
    // SAFETY: forwarded from the caller.
    let stmt = unsafe { PreparedStatement::prepare(db, sql)? };
    // The query compiled to a statement when the table was created; text that
    // no longer does has nothing to produce.
    Ok(stmt.map_or(ScanState::Exhausted, ScanState::Active))
}

unsafe impl VTabCursor for SqlExecCursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        _idx_str: Option<&str>,
        _args: &Filters<'_>,
    ) -> rusqlite::Result<()> {
        Ok(self.start_scan(idx_num)?)
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        Ok(self.advance()?)
    }

    fn eof(&self) -> bool {
        self.is_exhausted()
    }

    fn column(&self, ctx: &mut Context, col: c_int) -> rusqlite::Result<()> {
        let value = self.value(col)?;
        ctx.set_result(&ToSqlOutput::Borrowed(value))
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.row_id)
    }
}
