//! Per-severity fixed-window rate limiting.
//!
//! Quota for a severity lives in a bucket row of the state table keyed by
//! [`DedupKey::rate_bucket`]. The limiter runs inside the caller's unit of
//! work and locks the bucket there, so the quota check and the reservation
//! write commit or roll back together.

use crate::config::{DedupConfig, RateLimitPolicy, chrono_duration};
use crate::models::DedupKey;
use crate::storage::ReservationTx;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Checks and consumes per-severity send quota.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    policies: BTreeMap<String, RateLimitPolicy>,
}

impl RateLimiter {
    /// Collects the rate-limit policies configured for each severity.
    #[must_use]
    pub fn from_config(config: &DedupConfig) -> Self {
        let policies = config
            .severities
            .keys()
            .filter_map(|severity| {
                config
                    .rate_limit(severity)
                    .map(|policy| (severity.clone(), policy))
            })
            .collect();
        Self { policies }
    }

    /// Returns the policy for `severity`, if it is limited.
    #[must_use]
    pub fn policy(&self, severity: &str) -> Option<RateLimitPolicy> {
        self.policies.get(severity).copied()
    }

    /// Consumes one send from the quota of `severity` at `now`.
    ///
    /// Returns `false` when the current window is exhausted. Severities
    /// without a policy always pass and touch no state.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be locked or read, or
    /// [`Error::Conflict`] if its row changed despite the lock.
    pub fn check_and_consume(
        &self,
        tx: &mut dyn ReservationTx,
        severity: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(policy) = self.policy(severity) else {
            return Ok(true);
        };

        let bucket = DedupKey::rate_bucket(severity);
        tx.lock(&bucket)?;
        let mut state = tx.load_or_create(&bucket, Duration::zero(), now)?;

        let rolled = now - state.rate_limit_window_start >= chrono_duration(policy.window);
        if rolled {
            state.rate_limit_window_start = now;
            state.rate_limit_count = 0;
        }

        let allowed = state.rate_limit_count < i64::from(policy.limit);
        if allowed {
            state.rate_limit_count += 1;
        }
        if (allowed || rolled) && !tx.write(&mut state)? {
            return Err(Error::Conflict {
                fingerprint: bucket.fingerprint().to_string(),
                severity: severity.to_string(),
            });
        }

        debug!(
            severity = %severity,
            count = state.rate_limit_count,
            limit = policy.limit,
            allowed,
            "Rate limit checked"
        );
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryLockManager, LockManager};
    use std::time::Duration as StdDuration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn setup(limit: u32) -> (RateLimiter, InMemoryLockManager) {
        let config = DedupConfig::default().with_rate_limit("warning", limit, StdDuration::from_secs(60));
        (RateLimiter::from_config(&config), InMemoryLockManager::new(&config))
    }

    fn consume(limiter: &RateLimiter, locks: &InMemoryLockManager, severity: &str, now: DateTime<Utc>) -> bool {
        let key = DedupKey::new("any", severity);
        locks
            .with_lock(&key, |tx| limiter.check_and_consume(tx, severity, now))
            .unwrap()
    }

    #[test]
    fn test_limit_within_window() {
        let (limiter, locks) = setup(3);
        for i in 0..3 {
            assert!(consume(&limiter, &locks, "warning", t0() + Duration::seconds(i)));
        }
        assert!(!consume(&limiter, &locks, "warning", t0() + Duration::seconds(10)));

        let bucket = locks.snapshot(&DedupKey::rate_bucket("warning")).unwrap();
        assert_eq!(bucket.rate_limit_count, 3);
    }

    #[test]
    fn test_window_resets() {
        let (limiter, locks) = setup(1);
        assert!(consume(&limiter, &locks, "warning", t0()));
        assert!(!consume(&limiter, &locks, "warning", t0() + Duration::seconds(59)));
        assert!(consume(&limiter, &locks, "warning", t0() + Duration::seconds(60)));

        let bucket = locks.snapshot(&DedupKey::rate_bucket("warning")).unwrap();
        assert_eq!(bucket.rate_limit_window_start, t0() + Duration::seconds(60));
        assert_eq!(bucket.rate_limit_count, 1);
    }

    #[test]
    fn test_unlimited_severity_touches_nothing() {
        let (limiter, locks) = setup(1);
        for _ in 0..10 {
            assert!(consume(&limiter, &locks, "critical", t0()));
        }
        assert!(limiter.policy("critical").is_none());
        assert!(locks.is_empty());
    }

    #[test]
    fn test_zero_limit_always_rejects() {
        let (limiter, locks) = setup(0);
        assert!(!consume(&limiter, &locks, "warning", t0()));
        assert!(!consume(&limiter, &locks, "warning", t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_rejected_consumption_leaves_count() {
        let (limiter, locks) = setup(1);
        assert!(consume(&limiter, &locks, "warning", t0()));
        let before = locks.snapshot(&DedupKey::rate_bucket("warning")).unwrap();
        assert!(!consume(&limiter, &locks, "warning", t0() + Duration::seconds(1)));
        let after = locks.snapshot(&DedupKey::rate_bucket("warning")).unwrap();
        assert_eq!(before, after);
    }
}
