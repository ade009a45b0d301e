//! Cadence Coordination - Deciding when each federate may advance
//!
//! This crate holds all federation-wide coordination state:
//! - The dependency graph with its minimum-delay closure
//! - Per-federate scheduling state
//! - The tag advance engine that computes TAG / PTAG grants
//! - Two-phase stop coordination
//! - An in-process coordinator for enclaves sharing one address space
//!
//! Nothing here does I/O. Operations return [`Notice`]s that the caller
//! delivers to federates in order.

pub mod enclave;
pub mod engine;
pub mod error;
pub mod graph;
pub mod in_transit;
pub mod node;
pub mod stop;

pub use enclave::*;
pub use engine::*;
pub use error::*;
pub use graph::*;
pub use in_transit::*;
pub use node::*;
pub use stop::*;
