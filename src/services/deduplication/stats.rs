//! Process-local coordinator counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Rows read from the store.
    pub store_reads: u64,
    /// `should_send` calls answered by the local cache.
    pub cache_fast_path_hits: u64,
    /// Reservations created.
    pub reservations_created: u64,
    /// Reservations completed by `record_sent`.
    pub reservations_completed: u64,
    /// Reservations released by `release`.
    pub reservations_released: u64,
    /// Row-version guarded writes that affected no row.
    pub optimistic_conflicts: u64,
    /// `should_send` calls that returned a suppression.
    pub suppressed: u64,
}

#[derive(Debug, Default)]
pub(super) struct StatsCounters {
    pub(super) store_reads: AtomicU64,
    pub(super) cache_fast_path_hits: AtomicU64,
    pub(super) reservations_created: AtomicU64,
    pub(super) reservations_completed: AtomicU64,
    pub(super) reservations_released: AtomicU64,
    pub(super) optimistic_conflicts: AtomicU64,
    pub(super) suppressed: AtomicU64,
}

impl StatsCounters {
    pub(super) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            store_reads: self.store_reads.load(Ordering::Relaxed),
            cache_fast_path_hits: self.cache_fast_path_hits.load(Ordering::Relaxed),
            reservations_created: self.reservations_created.load(Ordering::Relaxed),
            reservations_completed: self.reservations_completed.load(Ordering::Relaxed),
            reservations_released: self.reservations_released.load(Ordering::Relaxed),
            optimistic_conflicts: self.optimistic_conflicts.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.store_reads);
        StatsCounters::bump(&counters.store_reads);
        StatsCounters::bump(&counters.suppressed);

        let stats = counters.snapshot();
        assert_eq!(stats.store_reads, 2);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.reservations_created, 0);
    }
}
