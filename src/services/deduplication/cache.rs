//! Process-local reservation cache.
//!
//! Remembers recently completed reservations so a repeat `should_send` for the
//! same key can be suppressed without a store round-trip.

use crate::config::DedupConfig;
use crate::models::ReservationId;
use crate::observability::metrics::CACHE_SIZE;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

/// Last known outcome of a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationCacheEntry {
    /// The reservation this entry describes.
    pub reservation_id: ReservationId,
    /// True once `record_sent` completed the reservation.
    pub completed: bool,
    /// Instant after which the entry is stale.
    pub expires_at: DateTime<Utc>,
}

impl ReservationCacheEntry {
    /// Returns true if the entry is stale at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// LRU map from [`crate::models::DedupKey::cache_hash`] to
/// [`ReservationCacheEntry`].
///
/// # Thread Safety
///
/// Uses `RwLock` for interior mutability; the cache has no cross-entry
/// invariants, so each call locks only for its own read or write.
///
/// # Lock Poisoning
///
/// A poisoned lock reads as a miss and writes are skipped. The store is
/// authoritative, so the only cost is a lost fast path.
pub struct ReservationCache {
    cache: RwLock<LruCache<u64, ReservationCacheEntry>>,
    ttl: Duration,
}

impl ReservationCache {
    /// Creates a cache holding at most `capacity` entries for `ttl` each.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Creates a cache sized from `config`.
    #[must_use]
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.cache_capacity, config.cache_ttl)
    }

    /// Returns the unexpired entry for `hash`.
    ///
    /// Uses `peek` so lookups only need the read lock; recency is refreshed by
    /// writes.
    #[must_use]
    pub fn get(&self, hash: u64, now: DateTime<Utc>) -> Option<ReservationCacheEntry> {
        let cache = self.cache.read().ok()?;
        cache
            .peek(&hash)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Records a completed reservation.
    ///
    /// The entry lives for the cache TTL, capped at `max_ttl` so it never
    /// outlives the state it stands for.
    pub fn record_completed(
        &self,
        hash: u64,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        max_ttl: chrono::Duration,
    ) {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or(max_ttl)
            .min(max_ttl);
        if ttl <= chrono::Duration::zero() {
            self.evict(hash);
            return;
        }
        let entry = ReservationCacheEntry {
            reservation_id,
            completed: true,
            expires_at: now + ttl,
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.put(hash, entry);
            metrics::gauge!(CACHE_SIZE).set(cache.len() as f64);
        }
    }

    /// Removes the entry for `hash`.
    pub fn evict(&self, hash: u64) {
        if let Ok(mut cache) = self.cache.write() {
            cache.pop(&hash);
            metrics::gauge!(CACHE_SIZE).set(cache.len() as f64);
        }
    }

    /// Drops every entry expired at `now` and returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut cache) = self.cache.write() else {
            return 0;
        };
        let expired: Vec<u64> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            cache.pop(hash);
        }
        metrics::gauge!(CACHE_SIZE).set(cache.len() as f64);
        expired.len()
    }

    /// Returns the number of entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for ReservationCache {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}
