//! Business logic services.
//!
//! Services orchestrate the storage layer behind high-level operations.

pub mod deduplication;
