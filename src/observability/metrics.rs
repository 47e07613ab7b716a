//! Metric names and recording helpers.
//!
//! Metrics go through the `metrics` facade; installing a recorder and
//! exporting is the embedding service's concern.

use crate::models::SuppressReason;
use std::time::Instant;

/// Suppressed decisions, labelled by `reason`.
pub const SUPPRESSED_TOTAL: &str = "alertgate_suppressed_total";
/// Races caught by a safety net, labelled by `scenario`.
pub const RACE_PREVENTED_TOTAL: &str = "alertgate_race_prevented_total";
/// Reservations created.
pub const RESERVATION_CREATED_TOTAL: &str = "alertgate_reservation_created_total";
/// Reservations completed by `record_sent`.
pub const RESERVATION_COMPLETED_TOTAL: &str = "alertgate_reservation_completed_total";
/// Reservations released by `release`.
pub const RESERVATION_RELEASED_TOTAL: &str = "alertgate_reservation_released_total";
/// Row-version guarded writes that affected no row.
pub const OPTIMISTIC_CONFLICT_TOTAL: &str = "alertgate_optimistic_conflict_total";
/// Reservations created by this process and not yet resolved by it.
pub const ACTIVE_RESERVATIONS: &str = "alertgate_active_reservations";
/// Entries in the local reservation cache.
pub const CACHE_SIZE: &str = "alertgate_reservation_cache_size";
/// Time spent waiting for a per-key lock, labelled by `strategy`.
pub const LOCK_WAIT_MS: &str = "alertgate_lock_wait_ms";
/// Store operation latency.
pub const STORAGE_OPERATION_DURATION_MS: &str = "alertgate_storage_operation_duration_ms";
/// Store operation count.
pub const STORAGE_OPERATIONS_TOTAL: &str = "alertgate_storage_operations_total";

/// Records a suppressed decision.
pub fn record_suppressed(reason: SuppressReason) {
    metrics::counter!(SUPPRESSED_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Records a race caught by the double-check or the fast path.
pub fn record_race_prevented(scenario: &'static str) {
    metrics::counter!(RACE_PREVENTED_TOTAL, "scenario" => scenario).increment(1);
}

/// Records how long a lock took to acquire.
pub fn record_lock_wait(strategy: &'static str, start: Instant) {
    metrics::histogram!(LOCK_WAIT_MS, "strategy" => strategy)
        .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records count and latency of a store operation.
///
/// # Arguments
///
/// * `backend` - Backend name (e.g., "sqlite", "postgresql")
/// * `operation` - Operation name (e.g., "load", "update")
/// * `start` - Operation start time from `Instant::now()`
/// * `status` - Operation status ("success" or "error")
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        STORAGE_OPERATIONS_TOTAL,
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        STORAGE_OPERATION_DURATION_MS,
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Returns `"success"` or `"error"` for a result.
pub const fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}
