//! Shared connection handling for the `SQLite` backend.

use crate::models::DedupKey;
use crate::{Error, Result};
use rusqlite::{Connection, ErrorCode};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Interval between `try_lock` attempts while waiting for the connection.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. Units of work roll back on
/// unwind, so the protected state is still consistent.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Mutex was poisoned, recovering");
            metrics::counter!("alertgate_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Acquires the connection mutex, giving up once `timeout` has elapsed.
///
/// Poisoned mutexes are recovered as in [`acquire_lock`].
///
/// # Errors
///
/// Returns [`Error::Transient`] if another unit of work in this process still
/// holds the connection when the deadline passes.
pub fn acquire_lock_with_timeout<T>(
    mutex: &Mutex<T>,
    timeout: Duration,
) -> Result<MutexGuard<'_, T>> {
    let start = Instant::now();

    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::warn!("Mutex was poisoned, recovering");
                metrics::counter!("alertgate_mutex_poison_recovery_total").increment(1);
                return Ok(poisoned.into_inner());
            },
            Err(TryLockError::WouldBlock) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    metrics::counter!("alertgate_mutex_timeout_total").increment(1);
                    return Err(Error::transient(
                        "sqlite_acquire_connection",
                        format!("connection busy for {elapsed:?} (deadline {timeout:?})"),
                    ));
                }
                std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout - elapsed));
            },
        }
    }
}

/// Configures a `SQLite` connection for concurrent use.
///
/// # Configuration Applied
///
/// - **WAL mode**: Readers proceed while a writer holds the lock
/// - **NORMAL synchronous**: Balances durability with performance
/// - **`busy_timeout`**: Waits up to `lock_timeout` for another connection's
///   write lock before failing with `SQLITE_BUSY`
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the busy timeout cannot be set.
pub fn configure_connection(conn: &Connection, lock_timeout: Duration) -> Result<()> {
    // journal_mode returns a row, so errors here are not fatal (in-memory
    // databases report "memory").
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.busy_timeout(lock_timeout)
        .map_err(|e| Error::OperationFailed {
            operation: "sqlite_busy_timeout".to_string(),
            cause: e.to_string(),
        })
}

/// Maps a `rusqlite` error from `operation` on `key` onto the crate taxonomy.
///
/// Constraint violations mean a concurrent writer won; everything else from
/// the driver (busy, locked, I/O) is worth retrying.
pub fn sqlite_error(operation: &str, key: &DedupKey, e: &rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::Conflict {
                fingerprint: key.fingerprint().to_string(),
                severity: key.severity().to_string(),
            }
        },
        _ => Error::transient(operation, e),
    }
}
