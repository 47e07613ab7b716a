//! Persistent deduplication state.

use super::DedupKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a reservation: 128 bits rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(String);

impl ReservationId {
    /// Wraps an existing reservation id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random reservation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReservationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ReservationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One row of the reservation store.
///
/// Rows are created on first sighting of a key and never deleted here.
/// `row_version` is the optimistic-concurrency token: every successful write
/// increments it, and a write carrying a stale version affects zero rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationState {
    /// Alert fingerprint (empty for a rate-limit bucket row).
    pub fingerprint: String,
    /// Alert severity.
    pub severity: String,
    /// Last successful completion.
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Suppression window after `last_sent_at`.
    #[serde(rename = "dedup_window_ms", with = "window_millis")]
    pub dedup_window: Duration,
    /// Active reservation, if any.
    pub reservation_id: Option<ReservationId>,
    /// Expiry of the active reservation.
    pub reservation_expires_at: Option<DateTime<Utc>>,
    /// Start of the current rate-limit window.
    pub rate_limit_window_start: DateTime<Utc>,
    /// Sends counted in the current rate-limit window.
    pub rate_limit_count: i64,
    /// Optimistic-concurrency token.
    pub row_version: i64,
}

impl DeduplicationState {
    /// Creates the zero state for a key first seen at `now`.
    #[must_use]
    pub fn new(key: &DedupKey, dedup_window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: key.fingerprint().to_string(),
            severity: key.severity().to_string(),
            last_sent_at: None,
            dedup_window,
            reservation_id: None,
            reservation_expires_at: None,
            rate_limit_window_start: now,
            rate_limit_count: 0,
            row_version: 0,
        }
    }

    /// Returns the key this row belongs to.
    #[must_use]
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.fingerprint.clone(), self.severity.clone())
    }

    /// Returns the reservation id if a reservation is active at `now`.
    ///
    /// Completed reservations are cleared on completion and expired ones fail
    /// the time check, so neither is ever reported as active.
    #[must_use]
    pub fn active_reservation(&self, now: DateTime<Utc>) -> Option<&ReservationId> {
        match (&self.reservation_id, self.reservation_expires_at) {
            (Some(id), Some(expires_at)) if expires_at > now => Some(id),
            _ => None,
        }
    }

    /// Returns true if a send at `now` falls inside the dedup window.
    #[must_use]
    pub fn within_dedup_window(&self, now: DateTime<Utc>) -> bool {
        self.last_sent_at
            .is_some_and(|sent| now - sent < self.dedup_window)
    }

    /// Installs a reservation.
    pub fn reserve(&mut self, id: ReservationId, expires_at: DateTime<Utc>) {
        self.reservation_id = Some(id);
        self.reservation_expires_at = Some(expires_at);
    }

    /// Marks the current reservation as delivered at `now`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.last_sent_at = Some(now);
        self.clear_reservation();
    }

    /// Clears the reservation fields.
    pub fn clear_reservation(&mut self) {
        self.reservation_id = None;
        self.reservation_expires_at = None;
    }

    /// Returns true if the stored reservation is exactly `id`.
    #[must_use]
    pub fn holds(&self, id: &ReservationId) -> bool {
        self.reservation_id.as_ref() == Some(id)
    }
}

/// Serializes the dedup window as whole milliseconds, matching the store.
mod window_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(window.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(Duration::milliseconds)
    }
}
