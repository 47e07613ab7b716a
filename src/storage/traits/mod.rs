//! Storage backend traits.

mod lock;
mod reservation;

pub use lock::LockManager;
pub use reservation::ReservationTx;
