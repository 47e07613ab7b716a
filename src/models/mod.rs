//! Data models for alertgate.
//!
//! This module contains the identity, persistent state and decision types
//! shared by the storage layer and the coordinator.

mod decision;
mod key;
mod state;

pub use decision::{SendDecision, SuppressReason};
pub use key::{DedupKey, MAX_FINGERPRINT_BYTES};
pub use state::{DeduplicationState, ReservationId};
