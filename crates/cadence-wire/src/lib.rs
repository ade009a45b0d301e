//! Cadence Wire Protocol - Binary messages exchanged with the RTI
//!
//! Every message starts with a one-byte type code followed by a fixed or
//! length-prefixed payload. All integers are little-endian.
//! - `codec`: byte-order helpers and a bounds-checked reader
//! - `message`: message types, encoding and streaming decoding
//! - `reject`: handshake rejection codes

pub mod codec;
pub mod message;
pub mod reject;

pub use codec::*;
pub use message::*;
pub use reject::*;
