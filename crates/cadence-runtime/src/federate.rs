//! Federate side of the RTI protocol
//!
//! [`FederateClient`] connects to an RTI, completes the handshake including
//! initial clock synchronization, and then exchanges coordination messages.
//! With runtime clock sync enabled a background task answers the RTI's UDP
//! probes and slews the client's clock.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use cadence_core::{CadenceError, CadenceResult, FederateId, Instant, Tag};
use cadence_time::{
    ClockSyncConfig, ClockSyncSession, PhysicalClock, SyncChannel, SyncOutcome, SyncedClock,
    SystemClock,
};
use cadence_transport::{
    connect_with_retry, split, MessageReader, MessageWriter, TransportConfig, UdpTransport,
};
use cadence_wire::{DataMessage, Message, NeighborStructure, TaggedMessage, NO_CLOCK_SYNC_PORT};

use crate::{ClockSyncMode, DEFAULT_FEDERATION_ID};

/// Pause between address queries while the peer has not advertised yet
pub const ADDRESS_QUERY_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct FederateConfig {
    pub federate: FederateId,
    pub federation_id: String,
    pub rti_addr: SocketAddr,
    pub neighbors: NeighborStructure,
    pub clock_sync: ClockSyncMode,
    pub clock_sync_config: ClockSyncConfig,
    pub transport: TransportConfig,
}

impl FederateConfig {
    pub fn new(federate: FederateId, rti_addr: SocketAddr) -> Self {
        FederateConfig {
            federate,
            federation_id: DEFAULT_FEDERATION_ID.to_string(),
            rti_addr,
            neighbors: NeighborStructure::default(),
            clock_sync: ClockSyncMode::default(),
            clock_sync_config: ClockSyncConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

pub struct FederateClient {
    id: FederateId,
    reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
    clock: Arc<SyncedClock<SystemClock>>,
    /// Messages read while waiting for a specific reply
    pending: VecDeque<Message>,
    transport: TransportConfig,
    udp_task: Option<JoinHandle<()>>,
    udp_exchanges: Arc<AtomicU64>,
}

impl FederateClient {
    /// Connect and complete the handshake.
    pub async fn connect(config: FederateConfig) -> CadenceResult<Self> {
        let id = config.federate;
        let timeout = config.transport.tcp_timeout;
        let stream = connect_with_retry(config.rti_addr, &config.transport).await?;
        let (mut reader, mut writer) = split(stream);

        writer
            .write_message(&Message::FedIds {
                federate: id,
                federation_id: config.federation_id.clone(),
            })
            .await?;
        match reader.read_message_timeout(timeout).await? {
            Message::Ack => {}
            Message::Reject(code) => {
                tracing::error!(federate = %id, reason = code.description(), "rejected by RTI");
                return Err(CadenceError::Rejected(code.to_u8()));
            }
            other => {
                return Err(CadenceError::UnexpectedMessage {
                    expected: "ACK",
                    actual: other.name(),
                })
            }
        }

        writer
            .write_message(&Message::NeighborStructure(config.neighbors.clone()))
            .await?;

        let udp = match config.clock_sync {
            ClockSyncMode::On => {
                let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
                Some(UdpTransport::bind(any).await?)
            }
            _ => None,
        };
        let udp_port = match (&config.clock_sync, &udp) {
            (ClockSyncMode::Off, _) => NO_CLOCK_SYNC_PORT,
            (_, Some(udp)) => udp.local_addr().port(),
            (_, None) => 0,
        };
        writer.write_message(&Message::UdpPort(udp_port)).await?;

        let clock = Arc::new(SyncedClock::new(SystemClock));
        let mut sync = ClockSyncSession::new(config.clock_sync_config.clone());
        loop {
            match reader.read_message_timeout(timeout).await? {
                Message::ClockSyncT1(t1) => {
                    sync.handle_t1(t1, clock.now());
                    writer.write_message(&Message::ClockSyncT3(id)).await?;
                    sync.t3_sent(clock.now());
                }
                Message::ClockSyncT4(t4) => {
                    let outcome = sync.handle_t4(t4, clock.now(), SyncChannel::Tcp);
                    if let SyncOutcome::Apply(offset) = outcome {
                        clock.adjust_immediately(offset);
                    }
                }
                Message::Ack => break,
                Message::Reject(code) => return Err(CadenceError::Rejected(code.to_u8())),
                other => {
                    return Err(CadenceError::UnexpectedMessage {
                        expected: "ACK",
                        actual: other.name(),
                    })
                }
            }
        }
        tracing::info!(federate = %id, rti = %config.rti_addr, offset = clock.target_offset(), "connected to RTI");

        let udp_exchanges = Arc::new(AtomicU64::new(0));
        let udp_task = udp.map(|udp| {
            tokio::spawn(answer_clock_sync(
                id,
                udp,
                clock.clone(),
                sync,
                udp_exchanges.clone(),
            ))
        });

        Ok(FederateClient {
            id,
            reader,
            writer,
            clock,
            pending: VecDeque::new(),
            transport: config.transport,
            udp_task,
            udp_exchanges,
        })
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    /// Physical clock corrected by clock synchronization
    pub fn clock(&self) -> &Arc<SyncedClock<SystemClock>> {
        &self.clock
    }

    pub fn physical_time(&self) -> Instant {
        self.clock.now()
    }

    /// Completed runtime clock sync exchanges
    pub fn clock_sync_exchanges(&self) -> u64 {
        self.udp_exchanges.load(Ordering::Relaxed)
    }

    pub async fn send(&mut self, msg: &Message) -> CadenceResult<()> {
        self.writer.write_message(msg).await
    }

    /// Next message from the RTI
    pub async fn recv(&mut self) -> CadenceResult<Message> {
        match self.pending.pop_front() {
            Some(msg) => Ok(msg),
            None => self.reader.read_message().await,
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> CadenceResult<Message> {
        match self.pending.pop_front() {
            Some(msg) => Ok(msg),
            None => self.reader.read_message_timeout(timeout).await,
        }
    }

    /// Propose the current physical time as start time and wait for the
    /// start time the RTI settles on.
    pub async fn negotiate_start_time(&mut self) -> CadenceResult<Instant> {
        let proposal = self.clock.now();
        self.send(&Message::Timestamp(proposal)).await?;
        loop {
            match self.reader.read_message().await? {
                Message::Timestamp(start) => {
                    tracing::info!(federate = %self.id, start_time = start, "start time agreed");
                    return Ok(start);
                }
                other => self.pending.push_back(other),
            }
        }
    }

    pub async fn send_next_event_tag(&mut self, tag: Tag) -> CadenceResult<()> {
        self.send(&Message::NextEventTag(tag)).await
    }

    pub async fn send_latest_tag_complete(&mut self, tag: Tag) -> CadenceResult<()> {
        self.send(&Message::LatestTagComplete(tag)).await
    }

    pub async fn send_stop_request(&mut self, tag: Tag) -> CadenceResult<()> {
        self.send(&Message::StopRequest(tag)).await
    }

    pub async fn send_stop_request_reply(&mut self, tag: Tag) -> CadenceResult<()> {
        self.send(&Message::StopRequestReply(tag)).await
    }

    /// Send a timed message through the RTI
    pub async fn send_tagged(
        &mut self,
        destination: FederateId,
        port: u16,
        tag: Tag,
        payload: Bytes,
    ) -> CadenceResult<()> {
        self.send(&Message::Tagged(TaggedMessage {
            port,
            federate: destination,
            tag,
            payload,
        }))
        .await
    }

    pub async fn send_data(&mut self, destination: FederateId, port: u16, payload: Bytes) -> CadenceResult<()> {
        self.send(&Message::Data(DataMessage {
            port,
            federate: destination,
            payload,
        }))
        .await
    }

    /// Tell `destination` that `port` has no message at `tag`
    pub async fn send_port_absent(&mut self, destination: FederateId, port: u16, tag: Tag) -> CadenceResult<()> {
        self.send(&Message::PortAbsent {
            port,
            federate: destination,
            tag,
        })
        .await
    }

    /// Advertise the port of this federate's peer-to-peer server
    pub async fn advertise_address(&mut self, port: u16) -> CadenceResult<()> {
        self.send(&Message::AddressAdvertisement(i32::from(port))).await
    }

    /// Ask the RTI where `federate` accepts peer-to-peer connections,
    /// retrying until it has advertised.
    pub async fn query_address(&mut self, federate: FederateId) -> CadenceResult<SocketAddr> {
        let deadline = tokio::time::Instant::now() + self.transport.connect_timeout;
        loop {
            self.send(&Message::AddressQuery(federate)).await?;
            let (port, addr) = loop {
                match self.reader.read_message().await? {
                    Message::AddressQueryReply { port, addr } => break (port, addr),
                    other => self.pending.push_back(other),
                }
            };
            if let Ok(port) = u16::try_from(port) {
                return Ok(SocketAddr::from((addr, port)));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CadenceError::Timeout(format!(
                    "federate {} never advertised its address",
                    federate
                )));
            }
            tokio::time::sleep(ADDRESS_QUERY_RETRY_INTERVAL).await;
        }
    }

    /// Leave the federation
    pub async fn resign(mut self) -> CadenceResult<()> {
        self.send(&Message::Resign).await?;
        self.writer.shutdown().await?;
        tracing::info!(federate = %self.id, "resigned");
        Ok(())
    }
}

impl Drop for FederateClient {
    fn drop(&mut self) {
        if let Some(task) = self.udp_task.take() {
            task.abort();
        }
    }
}

/// Answer the RTI's runtime clock sync datagrams
async fn answer_clock_sync(
    id: FederateId,
    udp: UdpTransport,
    clock: Arc<SyncedClock<SystemClock>>,
    mut sync: ClockSyncSession,
    exchanges: Arc<AtomicU64>,
) {
    loop {
        let (msg, from) = match udp.recv_from().await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!(federate = %id, error = %e, "bad clock sync datagram");
                continue;
            }
        };
        match msg {
            Message::ClockSyncT1(t1) => {
                sync.handle_t1(t1, clock.now());
                if let Err(e) = udp.send_to(&Message::ClockSyncT3(id), from).await {
                    tracing::debug!(federate = %id, error = %e, "failed to send T3");
                    sync.abandon_round();
                    continue;
                }
                sync.t3_sent(clock.now());
            }
            Message::ClockSyncT4(t4) => {
                sync.handle_t4(t4, clock.now(), SyncChannel::Udp);
            }
            Message::ClockSyncCodedProbe(t5) => match sync.handle_coded_probe(t5, clock.now()) {
                SyncOutcome::Apply(offset) => {
                    clock.adjust(offset);
                    exchanges.fetch_add(1, Ordering::Relaxed);
                }
                SyncOutcome::Accumulated | SyncOutcome::Unstable => {
                    exchanges.fetch_add(1, Ordering::Relaxed);
                }
                SyncOutcome::ImpureProbe | SyncOutcome::AwaitingProbe | SyncOutcome::Ignored => {}
            },
            other => {
                tracing::debug!(federate = %id, message = other.name(), "ignoring datagram");
            }
        }
    }
}
