//! Transaction depth bookkeeping and the fault-triggered rollback policy.
//!
//! Depth transitions use atomic compare-and-swap rather than a mutex: the
//! only cross-thread hazard guarded here is concurrent attempts to begin a
//! transaction racing on the counter. SQL execution itself is serialized by
//! the engine's own locking.

use std::sync::atomic::{AtomicI32, Ordering};

use rand::Rng as _;

use crate::DbError;

/// Engine result codes after which the recommended recovery is an explicit
/// full rollback: I/O error, disk full, busy, locked, out of memory,
/// interrupted.
pub(crate) fn is_retryable(error: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    matches!(
        error.sqlite_error_code(),
        Some(
            ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::OutOfMemory
                | ErrorCode::OperationInterrupted
        )
    )
}

/// Whether a failed transactional statement must trigger the full-rollback
/// failsafe before the error is re-raised.
pub(crate) fn forces_rollback(error: &DbError) -> bool {
    match error {
        DbError::Prepare(source) | DbError::Step(source) | DbError::Sqlite(source) => {
            is_retryable(source)
        }
        _ => false,
    }
}

/// Generates a savepoint identifier encoding the pre-increment depth:
/// a random token concatenated with the depth value.
pub(crate) fn savepoint_name(depth: i32) -> String {
    let token = rand::rng().random_range(0..i32::from(i16::MAX));
    format!("S{token}D{depth}")
}

/// Extracts the depth encoded in a savepoint identifier, if well-formed.
pub(crate) fn encoded_depth(savepoint: &str) -> Option<i32> {
    let marker = savepoint.find('D')?;
    if marker < 2 || marker + 1 >= savepoint.len() {
        return None;
    }
    savepoint[marker + 1..].parse().ok()
}

/// Nesting depth of the connection's transaction stack. Lives for the
/// connection's session; never persisted.
#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    depth: AtomicI32,
}

impl TransactionState {
    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Atomically transitions depth 0 -> 1. False when already in a
    /// transaction.
    pub fn try_begin(&self) -> bool {
        self.depth
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Increments depth, returning the pre-increment value.
    pub fn push(&self) -> i32 {
        self.depth.fetch_add(1, Ordering::SeqCst)
    }

    /// Undoes a failed `push`.
    pub fn pop(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Resets depth to zero, returning the previous value.
    pub fn reset(&self) -> i32 {
        self.depth.swap(0, Ordering::SeqCst)
    }

    pub fn set(&self, depth: i32) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    /// Validates a savepoint identifier against the current depth and
    /// returns its encoded depth.
    pub fn validate(&self, savepoint: &str) -> Result<i32, DbError> {
        if let Some(depth) = encoded_depth(savepoint)
            && depth >= 0
            && depth < self.depth()
        {
            return Ok(depth);
        }
        Err(DbError::TransactionState(format!(
            "savepoint \"{savepoint}\" is not valid; it should come from save_point()"
        )))
    }
}
