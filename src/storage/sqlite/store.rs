//! `SQLite`-backed lock manager and reservation store.

use super::connection::{
    acquire_lock, acquire_lock_with_timeout, configure_connection, sqlite_error,
};
use crate::config::DedupConfig;
use crate::models::{DedupKey, DeduplicationState};
use crate::observability::metrics::{record_lock_wait, record_operation_metrics, status_label};
use crate::storage::row::{SCHEMA_STATEMENTS, STATE_COLUMNS, StateRow};
use crate::storage::traits::{LockManager, ReservationTx};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Lock manager over a `SQLite` database.
///
/// Each unit of work is a `BEGIN IMMEDIATE` transaction, which takes the
/// database write lock up front. `SQLite` has no finer write lock, so units of
/// work for different keys also serialize; the backend suits tests,
/// single-node deployments and modest alert volumes. Several processes may
/// share one database file: `busy_timeout` makes them queue for the write lock
/// up to the configured deadline.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Connection>` for thread-safe access within the process. The
/// mutex and the write lock are both held for exactly the unit of work, and
/// one `lock_timeout` deadline covers waiting for both.
pub struct SqliteLockManager {
    /// Protected by Mutex because `rusqlite::Connection` is not `Sync`.
    conn: Mutex<Connection>,
    /// Path to the `SQLite` database (None for in-memory).
    db_path: Option<PathBuf>,
    /// Deadline for acquiring the connection and the write lock.
    lock_timeout: Duration,
}

impl SqliteLockManager {
    /// Opens (or creates) the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>, config: &DedupConfig) -> Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path).map_err(|e| Error::OperationFailed {
            operation: "open_sqlite".to_string(),
            cause: e.to_string(),
        })?;

        let manager = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
            lock_timeout: config.lock_timeout,
        };
        manager.initialize(config)?;
        Ok(manager)
    }

    /// Creates a private in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(config: &DedupConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::OperationFailed {
            operation: "open_sqlite_in_memory".to_string(),
            cause: e.to_string(),
        })?;

        let manager = Self {
            conn: Mutex::new(conn),
            db_path: None,
            lock_timeout: config.lock_timeout,
        };
        manager.initialize(config)?;
        Ok(manager)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub const fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn initialize(&self, config: &DedupConfig) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        configure_connection(&conn, config.lock_timeout)?;

        for statement in SCHEMA_STATEMENTS {
            conn.execute(statement, [])
                .map_err(|e| Error::OperationFailed {
                    operation: "create_alert_dedup_state".to_string(),
                    cause: e.to_string(),
                })?;
        }
        Ok(())
    }
}

impl LockManager for SqliteLockManager {
    #[instrument(skip(self, f), fields(backend = "sqlite", lock_token = key.lock_token()))]
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        let start = Instant::now();
        let mut conn = acquire_lock_with_timeout(&self.conn, self.lock_timeout)?;
        let remaining = self.lock_timeout.saturating_sub(start.elapsed());
        conn.busy_timeout(remaining)
            .map_err(|e| sqlite_error("sqlite_busy_timeout", key, &e))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error("sqlite_begin_immediate", key, &e))?;
        record_lock_wait(self.strategy(), start);

        // Dropping `tx` on the error path rolls the unit of work back.
        let value = f(&mut SqliteTx { tx: &tx })?;

        tx.commit()
            .map_err(|e| sqlite_error("sqlite_commit", key, &e))?;
        Ok(value)
    }

    fn strategy(&self) -> &'static str {
        "sqlite_immediate"
    }
}

/// Unit of work inside an open `BEGIN IMMEDIATE` transaction.
struct SqliteTx<'a> {
    tx: &'a Transaction<'a>,
}

impl ReservationTx for SqliteTx<'_> {
    fn load(&mut self, key: &DedupKey) -> Result<Option<DeduplicationState>> {
        let start = Instant::now();
        let result = self
            .tx
            .prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM alert_dedup_state
                 WHERE fingerprint = ?1 AND severity = ?2"
            ))
            .and_then(|mut stmt| {
                stmt.query_row(params![key.fingerprint(), key.severity()], |row| {
                    Ok(StateRow {
                        fingerprint: row.get(0)?,
                        severity: row.get(1)?,
                        last_sent_at: row.get(2)?,
                        dedup_window_ms: row.get(3)?,
                        reservation_id: row.get(4)?,
                        reservation_expires_at: row.get(5)?,
                        rate_limit_window_start: row.get(6)?,
                        rate_limit_count: row.get(7)?,
                        row_version: row.get(8)?,
                    })
                })
                .optional()
            });
        record_operation_metrics("sqlite", "load", start, status_label(&result));

        result
            .map_err(|e| sqlite_error("sqlite_load_state", key, &e))?
            .map(StateRow::into_state)
            .transpose()
    }

    fn insert_if_absent(&mut self, state: &DeduplicationState) -> Result<()> {
        let start = Instant::now();
        let row = StateRow::from(state);
        let result = self.tx.execute(
            &format!(
                "INSERT INTO alert_dedup_state ({STATE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (fingerprint, severity) DO NOTHING"
            ),
            params![
                row.fingerprint,
                row.severity,
                row.last_sent_at,
                row.dedup_window_ms,
                row.reservation_id,
                row.reservation_expires_at,
                row.rate_limit_window_start,
                row.rate_limit_count,
                row.row_version,
            ],
        );
        record_operation_metrics("sqlite", "insert", start, status_label(&result));

        result
            .map(|_| ())
            .map_err(|e| sqlite_error("sqlite_insert_state", &state.key(), &e))
    }

    fn update(&mut self, state: &DeduplicationState) -> Result<u64> {
        let start = Instant::now();
        let row = StateRow::from(state);
        let result = self.tx.execute(
            "UPDATE alert_dedup_state SET
                last_sent_at = ?3,
                dedup_window_ms = ?4,
                reservation_id = ?5,
                reservation_expires_at = ?6,
                rate_limit_window_start = ?7,
                rate_limit_count = ?8,
                row_version = row_version + 1
             WHERE fingerprint = ?1 AND severity = ?2 AND row_version = ?9",
            params![
                row.fingerprint,
                row.severity,
                row.last_sent_at,
                row.dedup_window_ms,
                row.reservation_id,
                row.reservation_expires_at,
                row.rate_limit_window_start,
                row.rate_limit_count,
                row.row_version,
            ],
        );
        record_operation_metrics("sqlite", "update", start, status_label(&result));

        result
            .map(|affected| affected as u64)
            .map_err(|e| sqlite_error("sqlite_update_state", &state.key(), &e))
    }

    /// The write lock taken by `BEGIN IMMEDIATE` already covers every key.
    fn lock(&mut self, _key: &DedupKey) -> Result<()> {
        Ok(())
    }
}
