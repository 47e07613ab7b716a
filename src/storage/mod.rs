//! Storage layer.
//!
//! Every backend provides two things through [`LockManager`]: per-key mutual
//! exclusion scoped to a unit of work, and row-version guarded access to
//! [`crate::models::DeduplicationState`] rows inside it.
//!
//! | Backend | Lock primitive | Scope |
//! |---------|----------------|-------|
//! | [`InMemoryLockManager`] | per-token lock table | one process |
//! | [`SqliteLockManager`] | `BEGIN IMMEDIATE` write lock | processes sharing one file |
//! | `PgAdvisoryLockManager` | `pg_advisory_xact_lock` | any number of servers |
//! | `PgRowLockManager` | `SELECT ... FOR UPDATE` | any number of servers |

// Millisecond columns are i64; conversions are range-checked in `row`.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Allow significant_drop_tightening - guards are held for the unit of work.
#![allow(clippy::significant_drop_tightening)]

mod memory;
mod row;
pub mod sqlite;
pub mod traits;

#[cfg(feature = "postgres")]
mod postgresql;

pub use memory::InMemoryLockManager;
pub use sqlite::SqliteLockManager;
pub use traits::{LockManager, ReservationTx};

#[cfg(feature = "postgres")]
pub use postgresql::{PgAdvisoryLockManager, PgRowLockManager, PostgresStore};
