//! Shared fixtures for integration tests.

#![allow(clippy::unwrap_used, dead_code)]

use alertgate::{
    DedupConfig, DedupKey, DeduplicationCoordinator, InMemoryLockManager, LockManager,
    ManualClock, ReservationCache, ReservationTx, Result, SqliteLockManager,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::TempDir;

/// Backend under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
}

/// Lock manager dispatching to one backend.
pub enum Locks {
    Memory(InMemoryLockManager),
    Sqlite(SqliteLockManager, TempDir),
}

impl Locks {
    pub fn open(backend: Backend, config: &DedupConfig) -> Self {
        match backend {
            Backend::Memory => Self::Memory(InMemoryLockManager::new(config)),
            Backend::Sqlite => {
                let dir = tempfile::tempdir().unwrap();
                let locks = SqliteLockManager::new(dir.path().join("alertgate.db"), config).unwrap();
                Self::Sqlite(locks, dir)
            },
        }
    }
}

impl LockManager for Locks {
    fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
    {
        match self {
            Self::Memory(locks) => locks.with_lock(key, f),
            Self::Sqlite(locks, _) => locks.with_lock(key, f),
        }
    }

    fn strategy(&self) -> &'static str {
        match self {
            Self::Memory(locks) => locks.strategy(),
            Self::Sqlite(locks, _) => locks.strategy(),
        }
    }
}

pub type TestCoordinator = DeduplicationCoordinator<Locks, Arc<ManualClock>>;

/// Fixed start instant for manual clocks.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Builds a coordinator on a manual clock starting at [`t0`].
pub fn coordinator(backend: Backend, config: DedupConfig) -> (TestCoordinator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let locks = Locks::open(backend, &config);
    let cache = ReservationCache::from_config(&config);
    let coordinator = DeduplicationCoordinator::with_clock(locks, cache, config, Arc::clone(&clock));
    (coordinator, clock)
}
