//! UDP transport for runtime clock synchronization

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use cadence_core::{CadenceError, CadenceResult};
use cadence_wire::Message;

use crate::UDP_BUFFER_SIZE;

/// One message per datagram
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> CadenceResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CadenceError::TransportError(e.to_string()))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| CadenceError::TransportError(e.to_string()))?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message to a destination
    pub async fn send_to(&self, msg: &Message, dest: SocketAddr) -> CadenceResult<()> {
        let bytes = msg.to_bytes();
        self.socket
            .send_to(&bytes, dest)
            .await
            .map_err(|e| CadenceError::TransportError(e.to_string()))?;
        Ok(())
    }

    /// Receive one message. A datagram that does not hold exactly one
    /// message is an error; the socket stays usable.
    pub async fn recv_from(&self) -> CadenceResult<(Message, SocketAddr)> {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        let (len, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| CadenceError::TransportError(e.to_string()))?;

        let msg = Message::decode(&buf[..len])?;
        Ok((msg, addr))
    }

    pub async fn recv_from_timeout(&self, timeout: Duration) -> CadenceResult<(Message, SocketAddr)> {
        tokio::time::timeout(timeout, self.recv_from())
            .await
            .map_err(|_| CadenceError::Timeout(format!("no datagram within {:?}", timeout)))?
    }

    /// Get a clone of the socket for concurrent operations
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}
