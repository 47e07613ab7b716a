//! Alert deduplication.
//!
//! ```text
//! should_send ──► ReservationCache ──► LockManager::with_lock
//!                  (fast reject)          │
//!                                         ├─ load_or_create state row
//!                                         ├─ active reservation? dedup window?
//!                                         ├─ RateLimiter::check_and_consume
//!                                         ├─ reserve + row-version write (retry once)
//!                                         └─ re-read and verify
//! record_sent ──► complete row ──► cache completed entry ──► sweep
//! release     ──► clear row    ──► evict cache entry     ──► sweep
//! ```

mod cache;
mod coordinator;
mod rate_limit;
mod stats;

pub use cache::{ReservationCache, ReservationCacheEntry};
pub use coordinator::DeduplicationCoordinator;
pub use rate_limit::RateLimiter;
pub use stats::CoordinatorStats;
