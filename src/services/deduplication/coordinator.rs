//! Deduplication coordinator.
//!
//! Orchestrates the local cache, the lock manager, the reservation store and
//! the rate limiter behind `should_send`, `record_sent` and `release`.

use crate::clock::{Clock, SystemClock};
use crate::config::{DedupConfig, chrono_duration};
use crate::models::{DedupKey, DeduplicationState, ReservationId, SendDecision, SuppressReason};
use crate::observability::metrics::{
    ACTIVE_RESERVATIONS, OPTIMISTIC_CONFLICT_TOTAL, RESERVATION_COMPLETED_TOTAL,
    RESERVATION_CREATED_TOTAL, RESERVATION_RELEASED_TOTAL, record_race_prevented,
    record_suppressed,
};
use crate::storage::{LockManager, ReservationTx};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::cache::ReservationCache;
use super::rate_limit::RateLimiter;
use super::stats::{CoordinatorStats, StatsCounters};

/// Attempts at a row-version guarded write before giving up.
const WRITE_ATTEMPTS: usize = 2;

/// Outcome of a `record_sent` or `release` unit of work.
enum Resolution {
    Applied(DateTime<Utc>),
    Mismatch(Error),
    Conflicted,
}

/// Decides whether alerts may be delivered.
///
/// Identical alerts arriving concurrently, in this process or in others
/// sharing the store, receive at most one reservation. Every state change
/// happens inside a lock-held unit of work with row-version guarded writes;
/// the local cache only short-circuits repeats of a key this process has just
/// completed.
///
/// # Example
///
/// ```rust
/// use alertgate::{DedupConfig, DeduplicationCoordinator, InMemoryLockManager, ReservationCache};
///
/// let config = DedupConfig::default();
/// let coordinator = DeduplicationCoordinator::new(
///     InMemoryLockManager::new(&config),
///     ReservationCache::from_config(&config),
///     config,
/// );
///
/// let first = coordinator.should_send("svc-cpu-high", "critical").unwrap();
/// assert!(first.allowed);
/// let second = coordinator.should_send("svc-cpu-high", "critical").unwrap();
/// assert!(!second.allowed);
///
/// let reservation = first.reservation_id.unwrap();
/// coordinator.record_sent("svc-cpu-high", "critical", &reservation).unwrap();
/// ```
pub struct DeduplicationCoordinator<L: LockManager, C: Clock = SystemClock> {
    locks: L,
    cache: ReservationCache,
    config: DedupConfig,
    rate_limiter: RateLimiter,
    clock: C,
    counters: StatsCounters,
}

impl<L: LockManager> DeduplicationCoordinator<L, SystemClock> {
    /// Creates a coordinator on the system clock.
    #[must_use]
    pub fn new(locks: L, cache: ReservationCache, config: DedupConfig) -> Self {
        Self::with_clock(locks, cache, config, SystemClock)
    }
}

impl<L: LockManager, C: Clock> DeduplicationCoordinator<L, C> {
    /// Creates a coordinator on an explicit clock.
    #[must_use]
    pub fn with_clock(locks: L, cache: ReservationCache, config: DedupConfig, clock: C) -> Self {
        let rate_limiter = RateLimiter::from_config(&config);
        Self {
            locks,
            cache,
            config,
            rate_limiter,
            clock,
            counters: StatsCounters::default(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Returns the local cache.
    #[must_use]
    pub const fn cache(&self) -> &ReservationCache {
        &self.cache
    }

    /// Returns the lock manager.
    #[must_use]
    pub const fn lock_manager(&self) -> &L {
        &self.locks
    }

    /// Returns a snapshot of this coordinator's counters.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Decides whether the alert `(fingerprint, severity)` may be delivered.
    ///
    /// An allowed decision carries a reservation that the caller must resolve
    /// with [`Self::record_sent`] after publishing or [`Self::release`] if
    /// publishing fails. An unresolved reservation expires after the
    /// configured reservation TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid keys, before any store
    /// access, and [`Error::Transient`] if the lock or store fails.
    #[instrument(
        skip(self, fingerprint),
        fields(operation = "should_send", severity = %severity, key_hash = tracing::field::Empty)
    )]
    pub fn should_send(&self, fingerprint: &str, severity: &str) -> Result<SendDecision> {
        let key = self.config.validate_key(fingerprint, severity)?;
        let hash = key.cache_hash();
        tracing::Span::current().record("key_hash", hash);

        if let Some(entry) = self.cache.get(hash, self.clock.now())
            && entry.completed
        {
            StatsCounters::bump(&self.counters.cache_fast_path_hits);
            tracing::debug!(
                reservation_id = %entry.reservation_id,
                "Suppressed by recent completion in local cache"
            );
            return Ok(self.suppressed(SuppressReason::CacheFastPath));
        }

        let decision = match self.locks.with_lock(&key, |tx| self.reserve(tx, &key)) {
            Ok(decision) => decision,
            Err(Error::Conflict { .. }) => {
                self.record_conflict();
                SendDecision::suppress(SuppressReason::OptimisticConflict)
            },
            Err(e) => return Err(e),
        };

        if let Some(reservation_id) = &decision.reservation_id {
            StatsCounters::bump(&self.counters.reservations_created);
            metrics::counter!(RESERVATION_CREATED_TOTAL).increment(1);
            metrics::gauge!(ACTIVE_RESERVATIONS).increment(1.0);
            tracing::info!(reservation_id = %reservation_id, "Reservation created");
        } else if let Some(reason) = decision.reason {
            return Ok(self.suppressed(reason));
        }
        Ok(decision)
    }

    /// Completes `reservation_id` after a successful publish.
    ///
    /// Idempotent: an unknown, expired or already completed reservation is
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid keys and
    /// [`Error::Transient`] if the lock or store fails.
    #[instrument(
        skip(self, fingerprint),
        fields(operation = "record_sent", severity = %severity, reservation_id = %reservation_id)
    )]
    pub fn record_sent(
        &self,
        fingerprint: &str,
        severity: &str,
        reservation_id: &ReservationId,
    ) -> Result<()> {
        let key = self.config.validate_key(fingerprint, severity)?;

        let resolution = self.locks.with_lock(&key, |tx| {
            self.resolve(tx, &key, reservation_id, |state, now| {
                if state.active_reservation(now) == Some(reservation_id) {
                    state.complete(now);
                    true
                } else {
                    false
                }
            })
        })?;

        match resolution {
            Resolution::Applied(now) => {
                StatsCounters::bump(&self.counters.reservations_completed);
                metrics::counter!(RESERVATION_COMPLETED_TOTAL).increment(1);
                metrics::gauge!(ACTIVE_RESERVATIONS).decrement(1.0);
                self.cache.record_completed(
                    key.cache_hash(),
                    reservation_id.clone(),
                    now,
                    chrono_duration(self.config.dedup_window(severity)),
                );
                tracing::info!("Reservation completed");
            },
            Resolution::Mismatch(e) => {
                tracing::warn!(error = %e, "Ignoring record_sent for inactive reservation");
            },
            Resolution::Conflicted => {
                tracing::warn!("Giving up on completion after repeated conflicts; reservation will expire");
            },
        }

        self.sweep_cache();
        Ok(())
    }

    /// Releases `reservation_id` after a failed publish so the alert can be
    /// retried immediately.
    ///
    /// Idempotent: a mismatched or already cleared reservation is logged and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid keys and
    /// [`Error::Transient`] if the lock or store fails.
    #[instrument(
        skip(self, fingerprint),
        fields(operation = "release", severity = %severity, reservation_id = %reservation_id)
    )]
    pub fn release(
        &self,
        fingerprint: &str,
        severity: &str,
        reservation_id: &ReservationId,
    ) -> Result<()> {
        let key = self.config.validate_key(fingerprint, severity)?;

        let resolution = self.locks.with_lock(&key, |tx| {
            self.resolve(tx, &key, reservation_id, |state, _| {
                if state.holds(reservation_id) {
                    state.clear_reservation();
                    true
                } else {
                    false
                }
            })
        })?;

        match resolution {
            Resolution::Applied(_) => {
                StatsCounters::bump(&self.counters.reservations_released);
                metrics::counter!(RESERVATION_RELEASED_TOTAL).increment(1);
                metrics::gauge!(ACTIVE_RESERVATIONS).decrement(1.0);
                tracing::info!("Reservation released");
            },
            Resolution::Mismatch(e) => {
                tracing::warn!(error = %e, "Ignoring release for unknown reservation");
            },
            Resolution::Conflicted => {
                tracing::warn!("Giving up on release after repeated conflicts; reservation will expire");
            },
        }

        self.cache.evict(key.cache_hash());
        self.sweep_cache();
        Ok(())
    }

    /// Reads the authoritative row for a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid keys and
    /// [`Error::Transient`] if the lock or store fails.
    pub fn inspect(&self, fingerprint: &str, severity: &str) -> Result<Option<DeduplicationState>> {
        let key = self.config.validate_key(fingerprint, severity)?;
        self.locks.with_lock(&key, |tx| self.load(tx, &key))
    }

    /// Evaluates and, if allowed, writes a new reservation.
    fn reserve(&self, tx: &mut dyn ReservationTx, key: &DedupKey) -> Result<SendDecision> {
        let now = self.clock.now();
        let dedup_window = chrono_duration(self.config.dedup_window(key.severity()));
        let mut quota_consumed = false;

        for attempt in 1..=WRITE_ATTEMPTS {
            let mut state = tx.load_or_create(key, dedup_window, now)?;
            StatsCounters::bump(&self.counters.store_reads);
            state.dedup_window = dedup_window;

            if state.active_reservation(now).is_some() {
                return Ok(SendDecision::suppress(SuppressReason::ActiveReservation));
            }
            if state.within_dedup_window(now) {
                return Ok(SendDecision::suppress(SuppressReason::DedupWindow));
            }
            if !quota_consumed {
                if !self.rate_limiter.check_and_consume(tx, key.severity(), now)? {
                    return Ok(SendDecision::suppress(SuppressReason::RateLimited));
                }
                quota_consumed = true;
            }

            let reservation_id = ReservationId::generate();
            let expires_at = now + chrono_duration(self.config.reservation_ttl);
            state.reserve(reservation_id.clone(), expires_at);
            if tx.write(&mut state)? {
                return self.verify_reservation(tx, key, &state, reservation_id);
            }

            tracing::debug!(attempt, "Reservation write lost a row-version race");
            if attempt < WRITE_ATTEMPTS {
                self.record_conflict();
            }
        }

        // Rolls back the unit of work, including any quota charged above.
        Err(Error::Conflict {
            fingerprint: key.fingerprint().to_string(),
            severity: key.severity().to_string(),
        })
    }

    /// Re-reads the row after a reservation write and self-heals if it no
    /// longer shows that reservation.
    fn verify_reservation(
        &self,
        tx: &mut dyn ReservationTx,
        key: &DedupKey,
        written: &DeduplicationState,
        reservation_id: ReservationId,
    ) -> Result<SendDecision> {
        let Some(mut stored) = self.load(tx, key)? else {
            record_race_prevented("row_vanished");
            tracing::warn!(key = %key, "State row vanished after reservation write");
            return Ok(SendDecision::suppress(SuppressReason::CompletedReservationMismatch));
        };

        if stored.holds(&reservation_id) && stored.row_version == written.row_version {
            return Ok(SendDecision::allow(reservation_id));
        }

        record_race_prevented("reservation_mismatch");
        tracing::warn!(
            reservation_id = %reservation_id,
            stored = ?stored.reservation_id,
            expected_version = written.row_version,
            stored_version = stored.row_version,
            "Reservation overwritten after write; clearing"
        );
        stored.clear_reservation();
        if !tx.write(&mut stored)? {
            self.record_conflict();
        }
        Ok(SendDecision::suppress(SuppressReason::CompletedReservationMismatch))
    }

    /// Applies `transition` to the row holding `reservation_id`, retrying once
    /// on a row-version conflict.
    fn resolve<F>(
        &self,
        tx: &mut dyn ReservationTx,
        key: &DedupKey,
        reservation_id: &ReservationId,
        transition: F,
    ) -> Result<Resolution>
    where
        F: Fn(&mut DeduplicationState, DateTime<Utc>) -> bool,
    {
        let now = self.clock.now();
        for attempt in 1..=WRITE_ATTEMPTS {
            let Some(mut state) = self.load(tx, key)? else {
                return Ok(Resolution::Mismatch(mismatch(reservation_id, None)));
            };
            if !transition(&mut state, now) {
                return Ok(Resolution::Mismatch(mismatch(
                    reservation_id,
                    state.reservation_id.as_ref(),
                )));
            }
            if tx.write(&mut state)? {
                return Ok(Resolution::Applied(now));
            }
            self.record_conflict();
            tracing::debug!(attempt, "Resolution write lost a row-version race");
        }
        Ok(Resolution::Conflicted)
    }

    fn load(&self, tx: &mut dyn ReservationTx, key: &DedupKey) -> Result<Option<DeduplicationState>> {
        StatsCounters::bump(&self.counters.store_reads);
        tx.load(key)
    }

    fn suppressed(&self, reason: SuppressReason) -> SendDecision {
        StatsCounters::bump(&self.counters.suppressed);
        record_suppressed(reason);
        tracing::debug!(reason = %reason, "Alert suppressed");
        SendDecision::suppress(reason)
    }

    fn record_conflict(&self) {
        StatsCounters::bump(&self.counters.optimistic_conflicts);
        metrics::counter!(OPTIMISTIC_CONFLICT_TOTAL).increment(1);
    }

    fn sweep_cache(&self) {
        let removed = self.cache.sweep_expired(self.clock.now());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
    }
}

fn mismatch(supplied: &ReservationId, stored: Option<&ReservationId>) -> Error {
    Error::ReservationMismatch {
        supplied: supplied.to_string(),
        stored: stored.map(ToString::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryLockManager;
    use chrono::Duration;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FP: &str = "svc-cpu-high";
    const SEV: &str = "critical";

    /// Fault to inject into the unit of work.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        /// The next `n` alert-row updates report zero affected rows.
        RejectUpdates(usize),
        /// The read after the first successful update sees a foreign
        /// reservation.
        TamperAfterWrite,
        /// Every update fails with a unique-index conflict.
        UniqueViolation,
    }

    /// Lock manager that injects faults into an in-memory store.
    struct FaultyLocks {
        inner: InMemoryLockManager,
        fault: Fault,
        rejected: AtomicUsize,
        tampered: AtomicUsize,
    }

    impl FaultyLocks {
        fn new(fault: Fault) -> Self {
            Self {
                inner: InMemoryLockManager::new(&DedupConfig::default()),
                fault,
                rejected: AtomicUsize::new(0),
                tampered: AtomicUsize::new(0),
            }
        }
    }

    impl LockManager for FaultyLocks {
        fn with_lock<T, F>(&self, key: &DedupKey, f: F) -> Result<T>
        where
            F: FnOnce(&mut dyn ReservationTx) -> Result<T>,
        {
            self.inner.with_lock(key, |tx| {
                let mut faulty = FaultyTx {
                    inner: tx,
                    locks: self,
                    written: false,
                };
                f(&mut faulty)
            })
        }

        fn strategy(&self) -> &'static str {
            "faulty"
        }
    }

    struct FaultyTx<'a> {
        inner: &'a mut dyn ReservationTx,
        locks: &'a FaultyLocks,
        written: bool,
    }

    impl ReservationTx for FaultyTx<'_> {
        fn load(&mut self, key: &DedupKey) -> Result<Option<DeduplicationState>> {
            let loaded = self.inner.load(key)?;
            if self.locks.fault == Fault::TamperAfterWrite
                && self.written
                && self.locks.tampered.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Ok(loaded.map(|mut state| {
                    state.reservation_id = Some(ReservationId::new("intruder"));
                    state
                }));
            }
            Ok(loaded)
        }

        fn insert_if_absent(&mut self, state: &DeduplicationState) -> Result<()> {
            self.inner.insert_if_absent(state)
        }

        fn update(&mut self, state: &DeduplicationState) -> Result<u64> {
            match self.locks.fault {
                Fault::RejectUpdates(n)
                    if !state.key().is_rate_bucket()
                        && self.locks.rejected.fetch_add(1, Ordering::SeqCst) < n =>
                {
                    Ok(0)
                },
                Fault::UniqueViolation => Err(Error::Conflict {
                    fingerprint: state.fingerprint.clone(),
                    severity: state.severity.clone(),
                }),
                _ => {
                    let affected = self.inner.update(state)?;
                    self.written |= affected == 1;
                    Ok(affected)
                },
            }
        }

        fn lock(&mut self, key: &DedupKey) -> Result<()> {
            self.inner.lock(key)
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn coordinator_with<L: LockManager>(
        locks: L,
        config: DedupConfig,
    ) -> (DeduplicationCoordinator<L, Arc<ManualClock>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = ReservationCache::from_config(&config);
        let coordinator =
            DeduplicationCoordinator::with_clock(locks, cache, config, Arc::clone(&clock));
        (coordinator, clock)
    }

    fn coordinator() -> (
        DeduplicationCoordinator<InMemoryLockManager, Arc<ManualClock>>,
        Arc<ManualClock>,
    ) {
        let config = DedupConfig::default();
        coordinator_with(InMemoryLockManager::new(&config), config)
    }

    #[test]
    fn test_first_call_reserves() {
        let (coordinator, _) = coordinator();
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert!(decision.allowed);
        assert!(decision.reason.is_none());

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert_eq!(state.reservation_id, decision.reservation_id);
        assert_eq!(state.reservation_expires_at, Some(t0() + Duration::seconds(30)));
        assert_eq!(state.row_version, 1);
    }

    #[test]
    fn test_active_reservation_suppresses() {
        let (coordinator, clock) = coordinator();
        assert!(coordinator.should_send(FP, SEV).unwrap().allowed);
        clock.advance(Duration::seconds(29));

        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::ActiveReservation));
        assert!(decision.reservation_id.is_none());
    }

    #[test]
    fn test_record_sent_completes_and_caches() {
        let (coordinator, clock) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        clock.advance(Duration::seconds(2));
        coordinator.record_sent(FP, SEV, &reservation).unwrap();

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert_eq!(state.last_sent_at, Some(t0() + Duration::seconds(2)));
        assert!(state.reservation_id.is_none());

        let reads = coordinator.stats().store_reads;
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::CacheFastPath));
        assert_eq!(coordinator.stats().store_reads, reads);
        assert_eq!(coordinator.stats().cache_fast_path_hits, 1);
    }

    #[test]
    fn test_record_sent_with_wrong_id_is_noop() {
        let (coordinator, _) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator
            .record_sent(FP, SEV, &ReservationId::new("someone-else"))
            .unwrap();

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert!(state.holds(&reservation));
        assert!(state.last_sent_at.is_none());
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_record_sent_after_expiry_is_noop() {
        let (coordinator, clock) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        clock.advance(Duration::seconds(31));
        coordinator.record_sent(FP, SEV, &reservation).unwrap();

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert!(state.last_sent_at.is_none());
        assert_eq!(coordinator.stats().reservations_completed, 0);
    }

    #[test]
    fn test_record_sent_for_unknown_key_is_noop() {
        let (coordinator, _) = coordinator();
        coordinator
            .record_sent(FP, SEV, &ReservationId::new("never-issued"))
            .unwrap();
        assert!(coordinator.inspect(FP, SEV).unwrap().is_none());
    }

    #[test]
    fn test_release_clears_reservation() {
        let (coordinator, _) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator.release(FP, SEV, &reservation).unwrap();

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert!(state.reservation_id.is_none());
        assert!(state.last_sent_at.is_none());

        let retry = coordinator.should_send(FP, SEV).unwrap();
        assert!(retry.allowed);
        assert_ne!(retry.reservation_id, Some(reservation));
        assert_eq!(coordinator.stats().reservations_released, 1);
    }

    #[test]
    fn test_release_evicts_cache_entry() {
        let (coordinator, clock) = coordinator();
        let key = DedupKey::new(FP, SEV);
        let first = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator.record_sent(FP, SEV, &first).unwrap();
        assert!(coordinator.cache().get(key.cache_hash(), clock.now()).is_some());

        // Past the dedup window but inside the cache TTL.
        clock.advance(Duration::seconds(301));
        let second = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator.cache().record_completed(
            key.cache_hash(),
            first,
            clock.now(),
            Duration::seconds(300),
        );

        coordinator.release(FP, SEV, &second).unwrap();
        assert!(coordinator.cache().get(key.cache_hash(), clock.now()).is_none());
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_release_sweeps_expired_cache_entries() {
        let (coordinator, clock) = coordinator();
        let stale = DedupKey::new("svc-disk-full", SEV);
        coordinator.cache().record_completed(
            stale.cache_hash(),
            ReservationId::new("stale"),
            clock.now(),
            Duration::seconds(30),
        );
        assert_eq!(coordinator.cache().len(), 1);

        clock.advance(Duration::seconds(31));
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator.release(FP, SEV, &reservation).unwrap();
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_release_with_wrong_id_keeps_reservation() {
        let (coordinator, _) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator
            .release(FP, SEV, &ReservationId::new("stale"))
            .unwrap();
        assert!(coordinator.inspect(FP, SEV).unwrap().unwrap().holds(&reservation));
    }

    #[test]
    fn test_invalid_input_rejected_before_store() {
        let (coordinator, _) = coordinator();
        assert!(matches!(coordinator.should_send("", SEV), Err(Error::InvalidInput(_))));
        assert!(matches!(
            coordinator.should_send(FP, "catastrophic"),
            Err(Error::InvalidInput(_))
        ));
        let oversized = "x".repeat(257);
        assert!(matches!(
            coordinator.record_sent(&oversized, SEV, &ReservationId::new("r")),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(coordinator.stats().store_reads, 0);
        assert!(coordinator.lock_manager().is_empty());
    }

    #[test]
    fn test_dedup_window_override_per_severity() {
        let config = DedupConfig::default().with_dedup_window("info", std::time::Duration::from_secs(5));
        let (coordinator, clock) = coordinator_with(InMemoryLockManager::new(&config), config);
        let reservation = coordinator.should_send(FP, "info").unwrap().reservation_id.unwrap();
        coordinator.record_sent(FP, "info", &reservation).unwrap();

        clock.advance(Duration::seconds(4));
        assert!(!coordinator.should_send(FP, "info").unwrap().allowed);
        clock.advance(Duration::seconds(1));
        assert!(coordinator.should_send(FP, "info").unwrap().allowed);
    }

    #[test]
    fn test_single_conflict_is_retried() {
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::RejectUpdates(1)), DedupConfig::default());
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert!(decision.allowed);
        assert_eq!(coordinator.stats().optimistic_conflicts, 1);
    }

    #[test]
    fn test_repeated_conflict_suppresses() {
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::RejectUpdates(2)), DedupConfig::default());
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::OptimisticConflict));
        assert_eq!(coordinator.stats().optimistic_conflicts, 2);
        assert_eq!(coordinator.stats().suppressed, 1);
        assert!(coordinator.inspect(FP, SEV).unwrap().is_none());
    }

    #[test]
    fn test_repeated_conflict_refunds_quota() {
        let config = DedupConfig::default().with_rate_limit(SEV, 1, std::time::Duration::from_secs(60));
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::RejectUpdates(2)), config);

        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::OptimisticConflict));
        assert!(coordinator.lock_manager().inner.snapshot(&DedupKey::rate_bucket(SEV)).is_none());

        // The single slot is still available once writes go through.
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert!(decision.allowed);
        let bucket = coordinator
            .lock_manager()
            .inner
            .snapshot(&DedupKey::rate_bucket(SEV))
            .unwrap();
        assert_eq!(bucket.rate_limit_count, 1);
    }

    #[test]
    fn test_quota_consumed_once_across_retry() {
        let config = DedupConfig::default().with_rate_limit(SEV, 5, std::time::Duration::from_secs(60));
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::RejectUpdates(1)), config);

        // The bucket write succeeds, the alert write is rejected once, and the
        // retry must not charge the bucket again.
        assert!(coordinator.should_send(FP, SEV).unwrap().allowed);
        let bucket = coordinator
            .lock_manager()
            .inner
            .snapshot(&DedupKey::rate_bucket(SEV))
            .unwrap();
        assert_eq!(bucket.rate_limit_count, 1);
    }

    #[test]
    fn test_unique_violation_suppresses_and_rolls_back() {
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::UniqueViolation), DedupConfig::default());
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::OptimisticConflict));
        assert!(coordinator.lock_manager().inner.is_empty());
    }

    #[test]
    fn test_double_check_self_heals() {
        let (coordinator, _) = coordinator_with(FaultyLocks::new(Fault::TamperAfterWrite), DedupConfig::default());
        let decision = coordinator.should_send(FP, SEV).unwrap();
        assert_eq!(decision.reason, Some(SuppressReason::CompletedReservationMismatch));

        let state = coordinator.inspect(FP, SEV).unwrap().unwrap();
        assert!(state.reservation_id.is_none());
        assert!(state.reservation_expires_at.is_none());

        // The row is clean again, so the next caller can reserve.
        assert!(coordinator.should_send(FP, SEV).unwrap().allowed);
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let (coordinator, _) = coordinator();
        let reservation = coordinator.should_send(FP, SEV).unwrap().reservation_id.unwrap();
        coordinator.should_send(FP, SEV).unwrap();
        coordinator.record_sent(FP, SEV, &reservation).unwrap();
        coordinator.record_sent(FP, SEV, &reservation).unwrap();

        let stats = coordinator.stats();
        assert_eq!(stats.reservations_created, 1);
        assert_eq!(stats.reservations_completed, 1);
        assert_eq!(stats.suppressed, 1);
    }

    #[test]
    fn test_record_sent_sweeps_expired_cache_entries() {
        let (coordinator, clock) = coordinator();
        let first = coordinator.should_send("a", SEV).unwrap().reservation_id.unwrap();
        coordinator.record_sent("a", SEV, &first).unwrap();
        assert_eq!(coordinator.cache().len(), 1);

        clock.advance(Duration::seconds(31));
        let second = coordinator.should_send("b", SEV).unwrap().reservation_id.unwrap();
        coordinator.record_sent("b", SEV, &second).unwrap();
        assert_eq!(coordinator.cache().len(), 1);
    }
}
