//! `SQLite` reservation store.
//!
//! ## Module Structure
//!
//! - `connection`: Connection configuration, mutex handling, error mapping
//! - `store`: [`SqliteLockManager`] and its unit of work

mod connection;
mod store;

pub use connection::{
    acquire_lock, acquire_lock_with_timeout, configure_connection, sqlite_error,
};
pub use store::SqliteLockManager;
