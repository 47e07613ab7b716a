//! Outcome of a `should_send` call.

use super::ReservationId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an alert was not allowed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The local cache saw a recent completion for this key.
    CacheFastPath,
    /// Another reservation for this key is active and unexpired.
    ActiveReservation,
    /// The key was delivered within its dedup window.
    DedupWindow,
    /// The severity's rate limit is exhausted for the current window.
    RateLimited,
    /// The row was modified concurrently twice in a row.
    OptimisticConflict,
    /// The post-write re-read did not show our reservation.
    CompletedReservationMismatch,
}

impl SuppressReason {
    /// Returns the stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CacheFastPath => "cache_fast_path",
            Self::ActiveReservation => "active_reservation",
            Self::DedupWindow => "dedup_window",
            Self::RateLimited => "rate_limited",
            Self::OptimisticConflict => "optimistic_conflict",
            Self::CompletedReservationMismatch => "completed_reservation_mismatch",
        }
    }
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision returned by `should_send`.
///
/// An allowed decision always carries a reservation id; a suppressed one
/// always carries a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendDecision {
    /// Whether the caller may publish the alert.
    pub allowed: bool,
    /// Reservation to pass to `record_sent` or `release`.
    pub reservation_id: Option<ReservationId>,
    /// Why the alert was suppressed.
    pub reason: Option<SuppressReason>,
}

impl SendDecision {
    /// Creates an allowing decision.
    #[must_use]
    pub const fn allow(reservation_id: ReservationId) -> Self {
        Self {
            allowed: true,
            reservation_id: Some(reservation_id),
            reason: None,
        }
    }

    /// Creates a suppressing decision.
    #[must_use]
    pub const fn suppress(reason: SuppressReason) -> Self {
        Self {
            allowed: false,
            reservation_id: None,
            reason: Some(reason),
        }
    }
}
