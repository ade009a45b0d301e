//! Error types for the Cadence RTI

use thiserror::Error;

/// Core Cadence errors
#[derive(Error, Debug)]
pub enum CadenceError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    // Handshake errors
    #[error("Rejected by RTI: code {0}")]
    Rejected(u8),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unrecoverable failure that terminates the process
    #[error("Fatal error during {operation}: {cause}")]
    Fatal { operation: String, cause: String },
}

impl CadenceError {
    pub fn fatal(operation: impl Into<String>, cause: impl ToString) -> Self {
        CadenceError::Fatal {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

impl From<std::io::Error> for CadenceError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => CadenceError::ConnectionClosed,
            _ => CadenceError::TransportError(e.to_string()),
        }
    }
}

/// Result type for Cadence operations
pub type CadenceResult<T> = Result<T, CadenceError>;
