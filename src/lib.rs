//! # Alertgate
//!
//! Alert deduplication coordinator for an operational alerting pipeline.
//!
//! Alertgate decides, under concurrent load and across cooperating server
//! processes, whether an alert identified by a fingerprint and severity should
//! be delivered. Identical alerts arriving concurrently produce at most one
//! reservation to deliver.
//!
//! ## Features
//!
//! - Per-key mutual exclusion backed by the relational store (advisory locks,
//!   `SELECT ... FOR UPDATE`, or SQLite's write lock)
//! - Optimistic concurrency on every state row (`row_version`)
//! - Time-bounded reservations that always make forward progress
//! - Dedup windows and per-severity fixed-window rate limits
//! - Process-local LRU fast path that is never authoritative
//!
//! ## Example
//!
//! ```rust,ignore
//! use alertgate::config::DedupConfig;
//! use alertgate::services::deduplication::{DeduplicationCoordinator, ReservationCache};
//! use alertgate::storage::SqliteLockManager;
//!
//! let config = DedupConfig::from_env();
//! let locks = SqliteLockManager::new("./alertgate.db", &config)?;
//! let cache = ReservationCache::from_config(&config);
//! let coordinator = DeduplicationCoordinator::new(locks, cache, config);
//!
//! let decision = coordinator.should_send("svc-cpu-high", "critical")?;
//! if let Some(reservation) = decision.reservation_id {
//!     match publish() {
//!         Ok(()) => coordinator.record_sent("svc-cpu-high", "critical", &reservation)?,
//!         Err(_) => coordinator.release("svc-cpu-high", "critical", &reservation)?,
//!     }
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod clock;
pub mod config;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DedupConfig, RateLimitPolicy, SeverityPolicy};
pub use models::{
    DedupKey, DeduplicationState, ReservationId, SendDecision, SuppressReason,
};
pub use services::deduplication::{CoordinatorStats, DeduplicationCoordinator, ReservationCache};
pub use storage::{InMemoryLockManager, LockManager, ReservationTx, SqliteLockManager};

#[cfg(feature = "postgres")]
pub use storage::{PgAdvisoryLockManager, PgRowLockManager, PostgresStore};

/// Error type for alertgate operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty or oversized fingerprint, unknown severity, bad config values |
/// | `Conflict` | A row-version guarded write matched no row |
/// | `ReservationMismatch` | A reservation id does not match stored state |
/// | `Transient` | Store connectivity failures, lock or statement timeouts |
/// | `OperationFailed` | Schema creation, config file parsing, subscriber setup |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised before any lock or store access, so a caller retrying the same
    /// input will fail the same way.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An optimistic-concurrency write was rejected.
    ///
    /// The coordinator retries once and then reports a suppression; this
    /// variant only escapes from store implementations used directly.
    #[error("concurrent modification of {fingerprint}:{severity}")]
    Conflict {
        /// Fingerprint of the contended key.
        fingerprint: String,
        /// Severity of the contended key.
        severity: String,
    },

    /// A supplied reservation id does not match the stored reservation.
    ///
    /// `record_sent` and `release` treat this as an idempotent no-op.
    #[error("reservation {supplied} does not match stored reservation {stored:?}")]
    ReservationMismatch {
        /// The reservation id the caller supplied.
        supplied: String,
        /// The reservation id currently stored, if any.
        stored: Option<String>,
    },

    /// The store or lock primitive failed in a way worth retrying.
    ///
    /// Raised when:
    /// - The connection pool or database cannot be reached
    /// - Lock acquisition exceeds the configured deadline
    /// - A statement times out or the transaction is aborted
    #[error("transient failure in '{operation}': {cause}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation failed and retrying will not help.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns true if the caller should retry with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Builds a [`Error::Transient`] from an operation name and cause.
    pub fn transient(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for alertgate operations.
pub type Result<T> = std::result::Result<T, Error>;
