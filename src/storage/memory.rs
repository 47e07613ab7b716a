//! In-memory reservation store and lock manager.
//!
//! Provides a process-local implementation of [`LockManager`] for tests and
//! single-process deployments. Locks are taken per lock token, mirroring the
//! advisory-lock backends, and each unit of work buffers its writes until it
//! commits.

use crate::config::DedupConfig;
use crate::models::{DedupKey, DeduplicationState};
use crate::observability::metrics::record_lock_wait;
use crate::storage::sqlite::acquire_lock;
use crate::storage::traits::{LockManager, ReservationTx};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// In-memory store guarded by a per-token lock table.
///
/// # Example
///
/// ```rust
/// use alertgate::{DedupConfig, DedupKey, InMemoryLockManager, LockManager};
///
/// let locks = InMemoryLockManager::new(&DedupConfig::default());
/// let key = DedupKey::new("svc-cpu-high", "critical");
/// let found = locks.with_lock(&key, |tx| tx.load(&key)).unwrap();
/// assert!(found.is_none());
/// ```
#[derive(Debug)]
pub struct InMemoryLockManager {
    rows: Mutex<HashMap<DedupKey, DeduplicationState>>,
    held: Mutex<HashSet<i64>>,
    released: Condvar,
    lock_timeout: Duration,
}

impl InMemoryLockManager {
    /// Creates an empty store using the configured lock deadline.
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_lock_timeout(config.lock_timeout)
    }

    /// Creates an empty store with an explicit lock deadline.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            lock_timeout,
        }
    }

    /// Returns the committed row for `key` without taking its lock.
    #[must_use]
    pub fn snapshot(&self, key: &DedupKey) -> Option<DeduplicationState> {
        acquire_lock(&self.rows).get(key).cloned()
    }

    /// Returns the number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.rows).len()
    }

    /// Returns true if no rows are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&self, token: i64) -> Result<TokenGuard<'_>> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut held = acquire_lock(&self.held);
        while held.contains(&token) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::transient(
                    "memory_lock_acquire",
                    format!("lock {token} not acquired within {:?}", self.lock_timeout),
                ));
            }
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        held.insert(token);
        Ok(TokenGuard {
            manager: self,
            token,
        })
    }
}

impl LockManager for InMemoryLockManager {
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        let start = Instant::now();
        let guard = self.acquire(key.lock_token())?;
        record_lock_wait(self.strategy(), start);

        let mut tx = MemoryTx {
            manager: self,
            guards: vec![guard],
            pending: HashMap::new(),
        };
        let value = f(&mut tx)?;

        let MemoryTx { pending, guards, .. } = tx;
        acquire_lock(&self.rows).extend(pending);
        drop(guards);
        Ok(value)
    }

    fn strategy(&self) -> &'static str {
        "memory"
    }
}

/// Releases a held token when dropped, including on unwind.
#[derive(Debug)]
struct TokenGuard<'a> {
    manager: &'a InMemoryLockManager,
    token: i64,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        acquire_lock(&self.manager.held).remove(&self.token);
        self.manager.released.notify_all();
    }
}

/// Unit of work over the in-memory store.
struct MemoryTx<'a> {
    manager: &'a InMemoryLockManager,
    guards: Vec<TokenGuard<'a>>,
    pending: HashMap<DedupKey, DeduplicationState>,
}

impl MemoryTx<'_> {
    fn current(&self, key: &DedupKey) -> Option<DeduplicationState> {
        self.pending
            .get(key)
            .cloned()
            .or_else(|| self.manager.snapshot(key))
    }
}

impl ReservationTx for MemoryTx<'_> {
    fn load(&mut self, key: &DedupKey) -> Result<Option<DeduplicationState>> {
        Ok(self.current(key))
    }

    fn insert_if_absent(&mut self, state: &DeduplicationState) -> Result<()> {
        let key = state.key();
        if self.current(&key).is_none() {
            self.pending.insert(key, state.clone());
        }
        Ok(())
    }

    fn update(&mut self, state: &DeduplicationState) -> Result<u64> {
        let key = state.key();
        match self.current(&key) {
            Some(stored) if stored.row_version == state.row_version => {
                let mut next = state.clone();
                next.row_version += 1;
                self.pending.insert(key, next);
                Ok(1)
            },
            _ => Ok(0),
        }
    }

    fn lock(&mut self, key: &DedupKey) -> Result<()> {
        let token = key.lock_token();
        if self.guards.iter().any(|g| g.token == token) {
            return Ok(());
        }
        let guard = self.manager.acquire(token)?;
        self.guards.push(guard);
        Ok(())
    }
}
