//! Lock manager trait.

use super::ReservationTx;
use crate::Result;
use crate::models::DedupKey;
use std::sync::Arc;

/// Per-key mutual exclusion scoped to a unit of work.
///
/// `with_lock` opens a unit of work on the backing store, acquires exclusive
/// access to `key`, and runs `f` against the store inside it. The unit of work
/// commits when `f` returns `Ok` and rolls back when it returns `Err` or
/// unwinds. The lock is released together with the unit of work in every case.
///
/// Keys are locked by [`DedupKey::lock_token`]; distinct keys only contend if
/// their tokens collide or the backend cannot lock at finer than database
/// granularity.
pub trait LockManager: Send + Sync {
    /// Runs `f` with exclusive access to `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transient`] if the lock cannot be acquired before
    /// the configured deadline or the store is unreachable, and propagates any
    /// error returned by `f`.
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>;

    /// Returns the strategy label used in metrics (e.g. `"pg_advisory"`).
    fn strategy(&self) -> &'static str;
}

impl<L: LockManager> LockManager for Arc<L> {
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        (**self).with_lock(key, f)
    }

    fn strategy(&self) -> &'static str {
        (**self).strategy()
    }
}
