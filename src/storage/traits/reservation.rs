//! Reservation store trait.

use crate::models::{DedupKey, DeduplicationState};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};

/// Typed access to [`DeduplicationState`] rows inside one unit of work.
///
/// Every write is conditioned on the caller's last observed `row_version`
/// and reports the number of affected rows; zero means another writer got
/// there first. The store never overwrites a row silently.
pub trait ReservationTx {
    /// Reads the row for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load(&mut self, key: &DedupKey) -> Result<Option<DeduplicationState>>;

    /// Inserts `state` unless a row for its key already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn insert_if_absent(&mut self, state: &DeduplicationState) -> Result<()>;

    /// Writes `state` if the stored row still has `state.row_version`.
    ///
    /// On success the stored version becomes `state.row_version + 1` and `1`
    /// is returned; a stale version returns `0` and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn update(&mut self, state: &DeduplicationState) -> Result<u64>;

    /// Extends exclusive access to a second key for the rest of the unit of
    /// work. Re-locking a key already held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transient`] if the lock is not acquired in time.
    fn lock(&mut self, key: &DedupKey) -> Result<()>;

    /// Reads the row for `key`, creating the zero state if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    fn load_or_create(
        &mut self,
        key: &DedupKey,
        dedup_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<DeduplicationState> {
        if let Some(state) = self.load(key)? {
            return Ok(state);
        }
        self.insert_if_absent(&DeduplicationState::new(key, dedup_window, now))?;
        self.load(key)?
            .ok_or_else(|| Error::transient("load_or_create", format!("row for {key} vanished")))
    }

    /// Writes `state` with [`ReservationTx::update`] and advances its
    /// in-memory `row_version` on success.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn write(&mut self, state: &mut DeduplicationState) -> Result<bool> {
        if self.update(state)? == 1 {
            state.row_version += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
