//! Cadence Core - Fundamental types shared by every layer of the RTI
//!
//! This crate defines:
//! - Logical tags (time + microstep) and delay arithmetic
//! - Federate identifiers
//! - The error taxonomy used by wire, transport and runtime code

pub mod error;
pub mod id;
pub mod tag;

pub use error::*;
pub use id::*;
pub use tag::*;
