//! Cadence Time - Physical clocks and clock synchronization
//!
//! This crate implements:
//! - A physical clock abstraction with a system and a manual implementation
//! - A clock that carries a synchronization offset and slews toward it
//! - The federate-side estimator of the T1/T3/T4 clock-sync exchange

pub mod clock;
pub mod sync;

pub use clock::*;
pub use sync::*;
