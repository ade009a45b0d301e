//! One task per connected federate
//!
//! The reader half runs the dispatch loop; a separate writer task drains the
//! session's outbound queue so grants computed under the federation lock
//! never wait on a slow socket.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use cadence_coord::CoordError;
use cadence_core::{CadenceError, FederateId, Tag};
use cadence_transport::{split, MessageWriter};
use cadence_wire::Message;

use crate::handshake::{self, Admitted};
use crate::Federation;

#[derive(Error, Debug)]
enum SessionError {
    #[error(transparent)]
    Wire(#[from] CadenceError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("unexpected {0} after the handshake")]
    Unexpected(&'static str),
}

/// Whether the session keeps reading after a message
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serve one accepted connection until the federate leaves
pub(crate) async fn serve(federation: Arc<Federation>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = split(stream);

    let Admitted { id, outbound } =
        match handshake::accept(&federation, &mut reader, &mut writer, peer).await {
            Ok(Some(admitted)) => admitted,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "handshake failed");
                return;
            }
        };

    let writer_task = tokio::spawn(write_loop(id, writer, outbound));

    loop {
        let msg = match reader.read_message().await {
            Ok(msg) => msg,
            Err(CadenceError::ConnectionClosed) => {
                tracing::info!(federate = %id, "connection closed");
                break;
            }
            Err(e) => {
                tracing::warn!(federate = %id, error = %e, "closing session on read error");
                break;
            }
        };
        tracing::debug!(federate = %id, message = msg.name(), "received");

        match handle_message(&federation, id, msg) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                tracing::warn!(federate = %id, error = %e, "protocol violation, closing session");
                break;
            }
        }
    }

    // Dropping the queue's sender lets the writer flush and exit
    federation.release(id);
    if let Err(e) = writer_task.await {
        tracing::warn!(federate = %id, error = %e, "writer task failed");
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: FederateId,
    mut writer: MessageWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        tracing::debug!(federate = %id, message = msg.name(), "sending");
        if let Err(e) = writer.write_message(&msg).await {
            tracing::warn!(federate = %id, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn handle_message(federation: &Arc<Federation>, id: FederateId, msg: Message) -> Result<Flow, SessionError> {
    let mut state = federation.lock();
    match msg {
        Message::NextEventTag(tag) => {
            let notices = state.ctx.update_federate_next_event_tag_locked(id, tag)?;
            state.dispatch(notices);
        }
        Message::LatestTagComplete(tag) => {
            let notices = state.ctx.logical_tag_complete(id, tag)?;
            state.dispatch(notices);
        }
        Message::StopRequest(tag) => {
            let was_open = state.ctx.stop_coordinator().is_in_progress();
            let notices = state.ctx.handle_stop_request(id, tag)?;
            state.dispatch(notices);
            if !was_open && state.ctx.stop_coordinator().is_in_progress() {
                drop(state);
                spawn_stop_timeout(federation.clone());
            }
        }
        Message::StopRequestReply(tag) => {
            let notices = state.ctx.handle_stop_request_reply(id, tag)?;
            state.dispatch(notices);
        }
        Message::Tagged(tagged) => {
            let destination = tagged.federate;
            if !state.is_connected(destination) {
                tracing::warn!(federate = %id, %destination, tag = %tagged.tag, "destination not connected, dropping tagged message");
                return Ok(Flow::Continue);
            }
            let notices = state.ctx.record_in_transit(destination, tagged.tag)?;
            state.send(destination, Message::Tagged(tagged));
            state.dispatch(notices);
        }
        Message::Data(data) => {
            let destination = data.federate;
            state.send(destination, Message::Data(data));
        }
        Message::PortAbsent { port, federate, tag } => {
            state.send(federate, Message::PortAbsent { port, federate, tag });
        }
        Message::AddressQuery(target) => {
            let (port, addr) = state.address_of(target);
            state.send(id, Message::AddressQueryReply { port, addr });
        }
        Message::AddressAdvertisement(port) => {
            tracing::debug!(federate = %id, port, "address advertised");
            state.advertise(id, port);
        }
        Message::Timestamp(proposal) => {
            let delay = federation.config().start_delay.as_nanos().min(i64::MAX as u128) as i64;
            state.propose_start(id, proposal, delay);
        }
        Message::ClockSyncT3(_) => {
            let now = federation.now();
            state.send(id, Message::ClockSyncT4(now));
        }
        Message::Resign => {
            tracing::info!(federate = %id, "federate resigned");
            return Ok(Flow::Close);
        }
        Message::Failed => {
            tracing::warn!(federate = %id, "federate reported failure");
            return Ok(Flow::Close);
        }
        other => return Err(SessionError::Unexpected(other.name())),
    }
    Ok(Flow::Continue)
}

/// Grant an open stop round once its replies have had time to arrive
fn spawn_stop_timeout(federation: Arc<Federation>) {
    let timeout = federation.config().stop_reply_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut state = federation.lock();
        let notices = state.ctx.force_stop_grant();
        state.dispatch(notices);
    });
}
