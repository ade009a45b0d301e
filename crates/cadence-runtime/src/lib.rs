//! Cadence Runtime - The RTI server and the federate side of the protocol
//!
//! This crate wires the coordination engine to the network:
//! - Configuration and logging setup
//! - The accept loop and per-federate handshake
//! - One session task per federate dispatching protocol messages
//! - Runtime clock synchronization over UDP
//! - A federate client for connecting to an RTI

pub mod config;
pub mod federate;
pub mod federation;
pub mod server;
pub mod telemetry;

mod clock_sync;
mod handshake;
mod session;

pub use config::*;
pub use federate::*;
pub use federation::*;
pub use server::*;
pub use telemetry::*;
