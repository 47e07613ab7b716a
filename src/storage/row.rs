//! Row conversion between [`DeduplicationState`] and SQL column values.
//!
//! Both SQL backends store timestamps as Unix epoch milliseconds and the dedup
//! window as milliseconds, so one primitive row shape serves both.

use crate::models::{DeduplicationState, ReservationId};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};

/// Columns of `alert_dedup_state` in select order.
pub const STATE_COLUMNS: &str = "fingerprint, severity, last_sent_at, dedup_window_ms, \
     reservation_id, reservation_expires_at, rate_limit_window_start, rate_limit_count, \
     row_version";

/// Idempotent schema shared by the SQL backends.
///
/// `BIGINT` maps to `INTEGER` affinity in `SQLite`. The partial unique index is
/// a second line of defense against two live reservations for one key,
/// independent of row-version checks.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS alert_dedup_state (
        fingerprint TEXT NOT NULL,
        severity TEXT NOT NULL,
        last_sent_at BIGINT,
        dedup_window_ms BIGINT NOT NULL,
        reservation_id TEXT,
        reservation_expires_at BIGINT,
        rate_limit_window_start BIGINT NOT NULL,
        rate_limit_count BIGINT NOT NULL DEFAULT 0,
        row_version BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (fingerprint, severity)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_alert_dedup_state_reservation
        ON alert_dedup_state (fingerprint, severity, reservation_id)
        WHERE reservation_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_alert_dedup_state_expiry
        ON alert_dedup_state (reservation_expires_at)
        WHERE reservation_id IS NOT NULL",
];

/// Primitive representation of a state row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRow {
    /// Alert fingerprint.
    pub fingerprint: String,
    /// Alert severity.
    pub severity: String,
    /// Epoch millis of the last completion.
    pub last_sent_at: Option<i64>,
    /// Dedup window in milliseconds.
    pub dedup_window_ms: i64,
    /// Active reservation id.
    pub reservation_id: Option<String>,
    /// Epoch millis of reservation expiry.
    pub reservation_expires_at: Option<i64>,
    /// Epoch millis of the rate-limit window start.
    pub rate_limit_window_start: i64,
    /// Sends in the current rate-limit window.
    pub rate_limit_count: i64,
    /// Optimistic-concurrency token.
    pub row_version: i64,
}

impl From<&DeduplicationState> for StateRow {
    fn from(state: &DeduplicationState) -> Self {
        Self {
            fingerprint: state.fingerprint.clone(),
            severity: state.severity.clone(),
            last_sent_at: state.last_sent_at.map(|t| t.timestamp_millis()),
            dedup_window_ms: state.dedup_window.num_milliseconds(),
            reservation_id: state.reservation_id.as_ref().map(|id| id.as_str().to_string()),
            reservation_expires_at: state.reservation_expires_at.map(|t| t.timestamp_millis()),
            rate_limit_window_start: state.rate_limit_window_start.timestamp_millis(),
            rate_limit_count: state.rate_limit_count,
            row_version: state.row_version,
        }
    }
}

impl StateRow {
    /// Converts the row back into domain state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if a stored timestamp is out of range.
    pub fn into_state(self) -> Result<DeduplicationState> {
        Ok(DeduplicationState {
            last_sent_at: self.last_sent_at.map(from_millis).transpose()?,
            dedup_window: Duration::milliseconds(self.dedup_window_ms.max(0)),
            reservation_id: self.reservation_id.map(ReservationId::from),
            reservation_expires_at: self.reservation_expires_at.map(from_millis).transpose()?,
            rate_limit_window_start: from_millis(self.rate_limit_window_start)?,
            rate_limit_count: self.rate_limit_count,
            row_version: self.row_version,
            fingerprint: self.fingerprint,
            severity: self.severity,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::OperationFailed {
        operation: "decode_state_row".to_string(),
        cause: format!("timestamp {ms} out of range"),
    })
}
