//! Transport timing defaults

use std::time::Duration;

/// Port the RTI listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 15045;

/// Largest datagram exchanged over UDP
pub const UDP_BUFFER_SIZE: usize = 1500;

/// Timeouts and retry policy for connections
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Pause between connection attempts
    pub connect_retry_interval: Duration,
    /// Give up connecting after this long
    pub connect_timeout: Duration,
    /// Pause between attempts to bind a busy port
    pub bind_retry_interval: Duration,
    pub bind_retry_attempts: u32,
    /// Read timeout during the handshake
    pub tcp_timeout: Duration,
    /// Wait for a UDP clock sync reply
    pub udp_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_retry_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(60),
            bind_retry_interval: Duration::from_secs(1),
            bind_retry_attempts: 60,
            tcp_timeout: Duration::from_secs(10),
            udp_timeout: Duration::from_secs(1),
        }
    }
}
