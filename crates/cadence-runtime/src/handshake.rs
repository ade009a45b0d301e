//! RTI side of the connection handshake
//!
//! FED_IDS -> ACK | REJECT, NEIGHBOR_STRUCTURE, UDP_PORT, optional initial
//! clock sync over TCP, then a closing ACK.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use cadence_core::{CadenceError, CadenceResult, FederateId};
use cadence_transport::{MessageReader, MessageWriter};
use cadence_wire::{Message, RejectCode, NO_CLOCK_SYNC_PORT};

use crate::{clock_sync, ClockSyncMode, Federation};

/// A federate that completed the handshake
pub(crate) struct Admitted {
    pub(crate) id: FederateId,
    pub(crate) outbound: mpsc::UnboundedReceiver<Message>,
}

async fn reject<W: AsyncWrite + Unpin>(
    writer: &mut MessageWriter<W>,
    code: RejectCode,
    peer: SocketAddr,
) -> CadenceResult<Option<Admitted>> {
    tracing::warn!(%peer, reason = code.description(), "rejecting connection");
    writer.write_message(&Message::Reject(code)).await?;
    let _ = writer.shutdown().await;
    Ok(None)
}

/// Run the handshake. `Ok(None)` means the peer was rejected.
pub(crate) async fn accept<R, W>(
    federation: &Federation,
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    peer: SocketAddr,
) -> CadenceResult<Option<Admitted>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let timeout = federation.config().tcp_timeout;
    let (id, federation_id) = match reader.read_message_timeout(timeout).await? {
        Message::FedIds {
            federate,
            federation_id,
        } => (federate, federation_id),
        // Another federate mistook us for its peer-to-peer server
        Message::P2pSendingFedId { .. } => {
            return reject(writer, RejectCode::WrongServer, peer).await
        }
        other => {
            tracing::warn!(%peer, message = other.name(), "expected FED_IDS");
            return reject(writer, RejectCode::UnexpectedMessage, peer).await;
        }
    };

    let outbound = match federation.claim(id, &federation_id, peer.ip()) {
        Ok(rx) => rx,
        Err(code) => return reject(writer, code, peer).await,
    };
    tracing::info!(federate = %id, %peer, "federate connecting");

    match finish(federation, id, reader, writer, peer).await {
        Ok(true) => Ok(Some(Admitted { id, outbound })),
        Ok(false) => {
            federation.release(id);
            Ok(None)
        }
        Err(e) => {
            federation.release(id);
            Err(e)
        }
    }
}

/// Steps after the slot is reserved. `Ok(false)` means the peer was rejected.
async fn finish<R, W>(
    federation: &Federation,
    id: FederateId,
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    peer: SocketAddr,
) -> CadenceResult<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = federation.config();
    writer.write_message(&Message::Ack).await?;

    match reader.read_message_timeout(config.tcp_timeout).await? {
        Message::NeighborStructure(neighbors) => federation.set_neighbors(id, &neighbors),
        other => {
            tracing::warn!(federate = %id, message = other.name(), "expected NEIGHBOR_STRUCTURE");
            reject(writer, RejectCode::UnexpectedMessage, peer).await?;
            return Ok(false);
        }
    }

    let udp_port = match reader.read_message_timeout(config.tcp_timeout).await? {
        Message::UdpPort(port) => port,
        other => {
            tracing::warn!(federate = %id, message = other.name(), "expected UDP_PORT");
            reject(writer, RejectCode::UnexpectedMessage, peer).await?;
            return Ok(false);
        }
    };

    if config.clock_sync >= ClockSyncMode::Init && udp_port != NO_CLOCK_SYNC_PORT {
        match clock_sync::initial_sync(federation, id, reader, writer).await {
            Ok(()) => tracing::debug!(federate = %id, "initial clock sync done"),
            Err(CadenceError::UnexpectedMessage { actual, .. }) => {
                tracing::warn!(federate = %id, message = actual, "unexpected message during clock sync");
                reject(writer, RejectCode::UnexpectedMessage, peer).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
    if config.clock_sync == ClockSyncMode::On && udp_port != NO_CLOCK_SYNC_PORT && udp_port != 0 {
        federation.set_clock_sync_addr(id, SocketAddr::new(peer.ip(), udp_port));
    }

    writer.write_message(&Message::Ack).await?;
    tracing::info!(federate = %id, "federate connected");
    Ok(true)
}
