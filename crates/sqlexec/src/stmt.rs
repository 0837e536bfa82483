//! Scoped ownership of a compiled SQLite statement.
//!
//! [`PreparedStatement`] pairs every successful `sqlite3_prepare_v2` with
//! exactly one `sqlite3_finalize`: either explicitly through
//! [`PreparedStatement::finalize`], which reports the result code, or
//! implicitly on drop, which can only log it.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};

use rusqlite::ffi;
use rusqlite::types::ValueRef;
use sqlexec_error::{ErrorCode, Result, SqlExecError};
use tracing::warn;

const SQLITE_OK: c_int = ErrorCode::Ok as c_int;
const SQLITE_ROW: c_int = ErrorCode::Row as c_int;
const SQLITE_DONE: c_int = ErrorCode::Done as c_int;

/// Outcome of a successful [`PreparedStatement::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    /// A result row is available.
    Row,
    /// The statement ran to completion.
    Done,
}

/// An exclusively owned `sqlite3_stmt`.
///
/// The handle is not `Send`: it must be stepped and finalized on the thread
/// that drives the owning connection's virtual table callbacks.
pub(crate) struct PreparedStatement {
    raw: NonNull<ffi::sqlite3_stmt>,
    db: *mut ffi::sqlite3,
}

impl PreparedStatement {
    /// Compile the first statement in `sql`.
    ///
    /// Returns `Ok(None)` when the text contains no statement at all (empty
    /// input, whitespace, or only comments). Text after the first statement
    /// is ignored.
    ///
    /// # Safety
    ///
    /// `db` must be an open connection that outlives the returned statement.
    pub(crate) unsafe fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Option<Self>> {
        let len = c_int::try_from(sql.len()).map_err(|_| SqlExecError::TooBig {
            length: sql.len(),
            max: usize::try_from(c_int::MAX).unwrap_or(usize::MAX),
        })?;

        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: `sql` is valid for `len` bytes; SQLite does not read past
        // `len` when it is non-negative.
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast::<c_char>(), len, &mut raw, &mut tail)
        };
        if rc != SQLITE_OK {
            // SAFETY: `db` is open per the caller's contract.
            let reason = unsafe { errmsg(db) };
            return Err(SqlExecError::Prepare {
                sql: sql.to_owned(),
                reason,
                code: rc,
            });
        }

        if !tail.is_null() {
            let consumed = (tail as usize).saturating_sub(sql.as_ptr() as usize);
            if let Some(rest) = sql.get(consumed..) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    warn!(ignored = %rest, "sqlexec: only the first statement of the backing query is used");
                }
            }
        }

        Ok(NonNull::new(raw).map(|raw| Self { raw, db }))
    }

    /// Number of result columns; zero for statements that return no data.
    pub(crate) fn column_count(&self) -> usize {
        // SAFETY: `raw` is a live statement.
        let count = unsafe { ffi::sqlite3_column_count(self.raw.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    /// Engine-assigned display name of result column `col`.
    ///
    /// SQLite only returns a null name when it fails to allocate one.
    pub(crate) fn column_name(&self, col: usize) -> Result<String> {
        let col = c_int::try_from(col)
            .map_err(|_| SqlExecError::internal(format!("column index {col} out of range")))?;
        // SAFETY: `raw` is a live statement; the returned pointer stays valid
        // until the statement is finalized and is copied out immediately.
        let name = unsafe { ffi::sqlite3_column_name(self.raw.as_ptr(), col) };
        if name.is_null() {
            return Err(SqlExecError::OutOfMemory);
        }
        // SAFETY: non-null column names are NUL-terminated UTF-8.
        let name = unsafe { CStr::from_ptr(name) };
        Ok(name.to_string_lossy().into_owned())
    }

    /// Evaluate the statement up to the next row.
    ///
    /// Any result other than `SQLITE_ROW`/`SQLITE_DONE` is returned as
    /// [`SqlExecError::Step`] with the engine's message; the statement is
    /// kept so that its owner can still finalize it.
    pub(crate) fn step(&mut self) -> Result<StepResult> {
        // SAFETY: `raw` is a live statement owned exclusively by `self`.
        let rc = unsafe { ffi::sqlite3_step(self.raw.as_ptr()) };
        match rc {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            code => Err(SqlExecError::Step {
                // SAFETY: the connection outlives the statement.
                message: unsafe { errmsg(self.db) },
                code,
            }),
        }
    }

    /// Value of column `col` in the current row.
    ///
    /// The returned reference aliases the statement's row buffer and is only
    /// valid until the next [`step`](Self::step) or until the statement is
    /// finalized, which the borrow on `self` enforces.
    pub(crate) fn value_ref(&self, col: c_int) -> Result<ValueRef<'_>> {
        let raw = self.raw.as_ptr();
        // SAFETY: `raw` is a live statement positioned on a row. Text and blob
        // pointers are read after `column_type` and before any call that could
        // convert the value, and `column_bytes` is read after the pointer, as
        // the SQLite documentation requires.
        let value = unsafe {
            match ffi::sqlite3_column_type(raw, col) {
                ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_column_int64(raw, col)),
                ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_column_double(raw, col)),
                ffi::SQLITE_TEXT => {
                    let text = ffi::sqlite3_column_text(raw, col);
                    if text.is_null() {
                        return Err(SqlExecError::OutOfMemory);
                    }
                    let len = usize::try_from(ffi::sqlite3_column_bytes(raw, col)).unwrap_or(0);
                    ValueRef::Text(std::slice::from_raw_parts(text, len))
                }
                ffi::SQLITE_BLOB => {
                    let blob = ffi::sqlite3_column_blob(raw, col);
                    let len = usize::try_from(ffi::sqlite3_column_bytes(raw, col)).unwrap_or(0);
                    if blob.is_null() || len == 0 {
                        ValueRef::Blob(&[])
                    } else {
                        ValueRef::Blob(std::slice::from_raw_parts(blob.cast::<u8>(), len))
                    }
                }
                _ => ValueRef::Null,
            }
        };
        Ok(value)
    }

    /// Finalize the statement and report the result.
    ///
    /// The handle is released whatever the outcome; `sql` only labels the
    /// error.
    pub(crate) fn finalize(self, sql: &str) -> Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `raw` is live and, because `Drop` is suppressed, finalized
        // exactly once.
        let rc = unsafe { ffi::sqlite3_finalize(this.raw.as_ptr()) };
        if rc == SQLITE_OK {
            return Ok(());
        }
        Err(SqlExecError::Finalize {
            sql: sql.to_owned(),
            // SAFETY: the connection outlives the statement.
            reason: unsafe { errmsg(this.db) },
            code: rc,
        })
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        // SAFETY: `raw` is live; `finalize` bypasses this impl, so this is the
        // only release on this path.
        let rc = unsafe { ffi::sqlite3_finalize(self.raw.as_ptr()) };
        if rc != SQLITE_OK {
            warn!(code = rc, "sqlexec: finalizing statement failed");
        }
    }
}

/// The connection's most recent error message.
///
/// # Safety
///
/// `db` must be an open connection.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: per the caller's contract; SQLite never returns null here for an
    // open handle, but guard anyway since the pointer crosses FFI.
    let msg = unsafe { ffi::sqlite3_errmsg(db) };
    if msg.is_null() {
        return String::from("unknown error");
    }
    // SAFETY: non-null messages are NUL-terminated.
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    fn handle(conn: &Connection) -> *mut ffi::sqlite3 {
        // SAFETY: the handle is only used while `conn` is alive.
        unsafe { conn.handle() }
    }

    #[test]
    fn test_prepare_reports_columns_and_names() {
        let conn = Connection::open_in_memory().unwrap();
        let stmt = unsafe { PreparedStatement::prepare(handle(&conn), "select 1 as a, 2 as b") }
            .unwrap()
            .expect("statement");
        assert_eq!(stmt.column_count(), 2);
        assert_eq!(stmt.column_name(0).unwrap(), "a");
        assert_eq!(stmt.column_name(1).unwrap(), "b");
        stmt.finalize("select 1 as a, 2 as b").unwrap();
    }

    #[test]
    fn test_prepare_empty_text_yields_no_statement() {
        let conn = Connection::open_in_memory().unwrap();
        for sql in ["", "   ", "-- just a comment", "/* block */"] {
            let stmt = unsafe { PreparedStatement::prepare(handle(&conn), sql) }.unwrap();
            assert!(stmt.is_none(), "expected no statement for {sql:?}");
        }
    }

    #[test]
    fn test_prepare_error_carries_engine_message() {
        let conn = Connection::open_in_memory().unwrap();
        let Err(err) = (unsafe { PreparedStatement::prepare(handle(&conn), "select * from nope") })
        else {
            panic!("prepare should fail");
        };
        match err {
            SqlExecError::Prepare { sql, reason, code } => {
                assert_eq!(sql, "select * from nope");
                assert!(reason.contains("no such table: nope"), "reason: {reason}");
                assert_eq!(code, ffi::SQLITE_ERROR);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_step_and_value_ref() {
        let conn = Connection::open_in_memory().unwrap();
        let sql = "select 7, 2.5, 'txt', x'0102', null";
        let mut stmt = unsafe { PreparedStatement::prepare(handle(&conn), sql) }
            .unwrap()
            .unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.value_ref(0).unwrap(), ValueRef::Integer(7));
        assert_eq!(stmt.value_ref(1).unwrap(), ValueRef::Real(2.5));
        assert_eq!(stmt.value_ref(2).unwrap(), ValueRef::Text(b"txt"));
        assert_eq!(stmt.value_ref(3).unwrap(), ValueRef::Blob(&[1, 2]));
        assert_eq!(stmt.value_ref(4).unwrap(), ValueRef::Null);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        stmt.finalize(sql).unwrap();
    }

    #[test]
    fn test_empty_blob_is_not_null() {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = unsafe { PreparedStatement::prepare(handle(&conn), "select x''") }
            .unwrap()
            .unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.value_ref(0).unwrap(), ValueRef::Blob(&[]));
    }

    #[test]
    fn test_step_error_is_reported_verbatim() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("create table t(a integer check (a > 0))")
            .unwrap();
        let sql = "insert into t values (-1) returning a";
        let mut stmt = unsafe { PreparedStatement::prepare(handle(&conn), sql) }
            .unwrap()
            .unwrap();
        let err = stmt.step().unwrap_err();
        assert!(matches!(
            &err,
            SqlExecError::Step { message, .. } if message.contains("CHECK constraint failed")
        ));
        // Dropping after a failed step must still release the handle.
        drop(stmt);
        conn.execute_batch("select 1").unwrap();
    }
}
