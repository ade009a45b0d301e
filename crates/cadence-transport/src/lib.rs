//! Cadence Transport Layer - Moving protocol messages between RTI and federates
//!
//! This crate provides:
//! - Framed TCP readers and writers over split streams
//! - Connect and bind helpers with retry
//! - UDP datagram transport for runtime clock synchronization

pub mod config;
pub mod tcp;
pub mod udp;

pub use config::*;
pub use tcp::*;
pub use udp::*;
