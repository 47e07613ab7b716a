//! PostgreSQL-backed lock managers and reservation store.
//!
//! Two strategies share one [`PostgresStore`]:
//!
//! - [`PgAdvisoryLockManager`] takes `pg_advisory_xact_lock(lock_token)` and
//!   never touches rows to lock them.
//! - [`PgRowLockManager`] takes `SELECT ... FOR UPDATE` on the state row.
//!   A key without a row is locked right after the unit of work inserts it;
//!   a concurrent inserter waits on the primary key until the first commits.
//!
//! Both lock inside the unit-of-work transaction, so commit or rollback
//! releases the lock and nothing can leak past a crashed caller. The store
//! drives the async driver from a private runtime; call it from blocking
//! threads, never from inside another Tokio runtime.

use crate::config::DedupConfig;
use crate::models::{DedupKey, DeduplicationState};
use crate::observability::metrics::{record_lock_wait, record_operation_metrics, status_label};
use crate::storage::row::{SCHEMA_STATEMENTS, STATE_COLUMNS, StateRow};
use crate::storage::traits::{LockManager, ReservationTx};
use crate::{Error, Result};
use deadpool_postgres::{Config, Pool, Runtime as PoolRuntime};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;
use tracing::{instrument, warn};

/// Default maximum connections in pool.
const DEFAULT_POOL_MAX_SIZE: usize = 20;

/// Which primitive serializes a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgLockStrategy {
    Advisory,
    RowLock,
}

impl PgLockStrategy {
    const fn label(self) -> &'static str {
        match self {
            Self::Advisory => "pg_advisory",
            Self::RowLock => "pg_row_lock",
        }
    }
}

/// Connection pool plus the runtime that drives it.
pub struct PostgresStore {
    pool: Pool,
    runtime: Runtime,
    lock_timeout: Duration,
}

impl PostgresStore {
    /// Connects to `connection_url` and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the pool cannot be built, or the
    /// schema cannot be created.
    pub fn connect(connection_url: &str, config: &DedupConfig) -> Result<Self> {
        Self::with_pool_size(connection_url, config, None)
    }

    /// Connects with an explicit pool size (defaults to 20).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the pool cannot be built, or the
    /// schema cannot be created.
    pub fn with_pool_size(
        connection_url: &str,
        config: &DedupConfig,
        pool_max_size: Option<usize>,
    ) -> Result<Self> {
        let pg_config = connection_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::OperationFailed {
                operation: "postgres_parse_url".to_string(),
                cause: e.to_string(),
            })?;
        let cfg = build_pool_config(&pg_config, pool_max_size, config.lock_timeout);
        let pool = cfg
            .create_pool(Some(PoolRuntime::Tokio1), NoTls)
            .map_err(|e| Error::OperationFailed {
                operation: "postgres_create_pool".to_string(),
                cause: e.to_string(),
            })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| Error::OperationFailed {
                operation: "postgres_create_runtime".to_string(),
                cause: e.to_string(),
            })?;

        let store = Self {
            pool,
            runtime,
            lock_timeout: config.lock_timeout,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Creates the state table and indexes if they are missing.
    fn ensure_schema(&self) -> Result<()> {
        self.runtime.block_on(async {
            let client = self.pool.get().await.map_err(|e| Error::OperationFailed {
                operation: "postgres_get_client".to_string(),
                cause: e.to_string(),
            })?;
            for statement in SCHEMA_STATEMENTS {
                client
                    .batch_execute(statement)
                    .await
                    .map_err(|e| Error::OperationFailed {
                        operation: "create_alert_dedup_state".to_string(),
                        cause: e.to_string(),
                    })?;
            }
            Ok(())
        })
    }

    fn run<T, F>(&self, key: &DedupKey, strategy: PgLockStrategy, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        let start = Instant::now();
        let mut client = self
            .runtime
            .block_on(self.pool.get())
            .map_err(|e| Error::transient("postgres_get_client", e))?;
        let tx = self
            .runtime
            .block_on(client.transaction())
            .map_err(|e| pg_error("postgres_begin", key, &e))?;
        let timeout_ms = self.lock_timeout.as_millis();
        self.runtime
            .block_on(tx.batch_execute(&format!(
                "SET LOCAL lock_timeout = '{timeout_ms}ms'; \
                 SET LOCAL statement_timeout = '{}ms'",
                timeout_ms.saturating_mul(2)
            )))
            .map_err(|e| pg_error("postgres_set_timeouts", key, &e))?;

        let outcome = {
            let mut uow = PgTx {
                runtime: &self.runtime,
                tx: &tx,
                strategy,
                pending_row_locks: Vec::new(),
            };
            uow.lock(key).and_then(|()| {
                record_lock_wait(strategy.label(), start);
                f(&mut uow)
            })
        };

        match outcome {
            Ok(value) => {
                self.runtime
                    .block_on(tx.commit())
                    .map_err(|e| pg_error("postgres_commit", key, &e))?;
                Ok(value)
            },
            Err(err) => {
                if let Err(rollback) = self.runtime.block_on(tx.rollback()) {
                    warn!(key = %key, error = %rollback, "Rollback failed; connection discards the transaction");
                }
                Err(err)
            },
        }
    }
}

/// Builds a deadpool config from a tokio-postgres config.
///
/// Pool waits are bounded by the lock deadline so a starved pool surfaces as
/// a transient error instead of hanging the caller.
fn build_pool_config(
    config: &tokio_postgres::Config,
    pool_max_size: Option<usize>,
    lock_timeout: Duration,
) -> Config {
    let mut cfg = Config::new();
    cfg.host = config.get_hosts().first().map(host_to_string);
    cfg.port = config.get_ports().first().copied();
    cfg.user = config.get_user().map(String::from);
    cfg.password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string());
    cfg.dbname = config.get_dbname().map(String::from);

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: pool_max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE),
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(lock_timeout),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    });
    cfg.manager = Some(deadpool_postgres::ManagerConfig {
        recycling_method: deadpool_postgres::RecyclingMethod::Fast,
    });
    cfg
}

#[cfg(unix)]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    match h {
        tokio_postgres::config::Host::Tcp(s) => s.clone(),
        tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
    }
}

#[cfg(not(unix))]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    let tokio_postgres::config::Host::Tcp(s) = h;
    s.clone()
}

/// Maps a driver error: unique violations conflict, everything else is
/// worth retrying.
fn pg_error(operation: &str, key: &DedupKey, e: &tokio_postgres::Error) -> Error {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return Error::Conflict {
            fingerprint: key.fingerprint().to_string(),
            severity: key.severity().to_string(),
        };
    }
    Error::transient(operation, e)
}

/// Lock manager using transaction-scoped advisory locks.
pub struct PgAdvisoryLockManager {
    store: PostgresStore,
}

impl PgAdvisoryLockManager {
    /// Wraps an existing store.
    #[must_use]
    pub const fn new(store: PostgresStore) -> Self {
        Self { store }
    }

    /// Connects to `connection_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be initialized.
    pub fn connect(connection_url: &str, config: &DedupConfig) -> Result<Self> {
        PostgresStore::connect(connection_url, config).map(Self::new)
    }
}

impl LockManager for PgAdvisoryLockManager {
    #[instrument(skip(self, f), fields(backend = "postgresql", lock_token = key.lock_token()))]
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        self.store.run(key, PgLockStrategy::Advisory, f)
    }

    fn strategy(&self) -> &'static str {
        PgLockStrategy::Advisory.label()
    }
}

/// Lock manager using `SELECT ... FOR UPDATE` on the state row.
pub struct PgRowLockManager {
    store: PostgresStore,
}

impl PgRowLockManager {
    /// Wraps an existing store.
    #[must_use]
    pub const fn new(store: PostgresStore) -> Self {
        Self { store }
    }

    /// Connects to `connection_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be initialized.
    pub fn connect(connection_url: &str, config: &DedupConfig) -> Result<Self> {
        PostgresStore::connect(connection_url, config).map(Self::new)
    }
}

impl LockManager for PgRowLockManager {
    #[instrument(skip(self, f), fields(backend = "postgresql", lock_token = key.lock_token()))]
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        self.store.run(key, PgLockStrategy::RowLock, f)
    }

    fn strategy(&self) -> &'static str {
        PgLockStrategy::RowLock.label()
    }
}

/// Unit of work inside an open PostgreSQL transaction.
struct PgTx<'a> {
    runtime: &'a Runtime,
    tx: &'a deadpool_postgres::Transaction<'a>,
    strategy: PgLockStrategy,
    /// Row-lock keys that had no row to lock yet.
    pending_row_locks: Vec<DedupKey>,
}

impl PgTx<'_> {
    fn execute_state(
        &self,
        operation: &'static str,
        sql: &str,
        state: &DeduplicationState,
    ) -> Result<u64> {
        let start = Instant::now();
        let row = StateRow::from(state);
        let result = self.runtime.block_on(self.tx.execute(
            sql,
            &[
                &row.fingerprint,
                &row.severity,
                &row.last_sent_at,
                &row.dedup_window_ms,
                &row.reservation_id,
                &row.reservation_expires_at,
                &row.rate_limit_window_start,
                &row.rate_limit_count,
                &row.row_version,
            ],
        ));
        record_operation_metrics("postgresql", operation, start, status_label(&result));
        result.map_err(|e| pg_error(operation, &state.key(), &e))
    }

    /// Takes `FOR UPDATE` on the row for `key`; false if there is no row.
    fn lock_row(&self, key: &DedupKey) -> Result<bool> {
        self.runtime
            .block_on(self.tx.query_opt(
                "SELECT row_version FROM alert_dedup_state
                 WHERE fingerprint = $1 AND severity = $2 FOR UPDATE",
                &[&key.fingerprint(), &key.severity()],
            ))
            .map(|row| row.is_some())
            .map_err(|e| pg_error("postgres_row_lock", key, &e))
    }
}

impl ReservationTx for PgTx<'_> {
    fn load(&mut self, key: &DedupKey) -> Result<Option<DeduplicationState>> {
        let start = Instant::now();
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM alert_dedup_state
             WHERE fingerprint = $1 AND severity = $2"
        );
        let result = self
            .runtime
            .block_on(self.tx.query_opt(sql.as_str(), &[&key.fingerprint(), &key.severity()]));
        record_operation_metrics("postgresql", "load", start, status_label(&result));

        let Some(row) = result.map_err(|e| pg_error("postgres_load_state", key, &e))? else {
            return Ok(None);
        };
        decode_row(&row)
            .map_err(|e| pg_error("postgres_decode_state", key, &e))?
            .into_state()
            .map(Some)
    }

    fn insert_if_absent(&mut self, state: &DeduplicationState) -> Result<()> {
        self.execute_state(
            "insert",
            &format!(
                "INSERT INTO alert_dedup_state ({STATE_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (fingerprint, severity) DO NOTHING"
            ),
            state,
        )?;

        let key = state.key();
        if let Some(pos) = self.pending_row_locks.iter().position(|k| *k == key) {
            if !self.lock_row(&key)? {
                return Err(Error::transient(
                    "postgres_row_lock",
                    format!("row for {key} missing after insert"),
                ));
            }
            self.pending_row_locks.swap_remove(pos);
        }
        Ok(())
    }

    fn update(&mut self, state: &DeduplicationState) -> Result<u64> {
        self.execute_state(
            "update",
            "UPDATE alert_dedup_state SET
                last_sent_at = $3,
                dedup_window_ms = $4,
                reservation_id = $5,
                reservation_expires_at = $6,
                rate_limit_window_start = $7,
                rate_limit_count = $8,
                row_version = row_version + 1
             WHERE fingerprint = $1 AND severity = $2 AND row_version = $9",
            state,
        )
    }

    fn lock(&mut self, key: &DedupKey) -> Result<()> {
        match self.strategy {
            PgLockStrategy::Advisory => {
                self.runtime
                    .block_on(
                        self.tx
                            .execute("SELECT pg_advisory_xact_lock($1)", &[&key.lock_token()]),
                    )
                    .map_err(|e| pg_error("postgres_advisory_lock", key, &e))?;
            },
            PgLockStrategy::RowLock => {
                if !self.pending_row_locks.contains(key) && !self.lock_row(key)? {
                    self.pending_row_locks.push(key.clone());
                }
            },
        }
        Ok(())
    }
}

fn decode_row(row: &tokio_postgres::Row) -> std::result::Result<StateRow, tokio_postgres::Error> {
    Ok(StateRow {
        fingerprint: row.try_get(0)?,
        severity: row.try_get(1)?,
        last_sent_at: row.try_get(2)?,
        dedup_window_ms: row.try_get(3)?,
        reservation_id: row.try_get(4)?,
        reservation_expires_at: row.try_get(5)?,
        rate_limit_window_start: row.try_get(6)?,
        rate_limit_count: row.try_get(7)?,
        row_version: row.try_get(8)?,
    })
}
