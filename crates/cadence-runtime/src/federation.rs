//! Federation-wide RTI state
//!
//! Everything sessions share lives behind one lock: the coordination
//! context, the outbound queue of every connected federate, advertised
//! addresses and the start time negotiation. Messages produced while the
//! lock is held are queued before it is released, so each federate sees
//! grants in the order they were computed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

use cadence_coord::{FederationContext, Notice, NoticeKind};
use cadence_core::{FederateId, Instant, Interval};
use cadence_time::PhysicalClock;
use cadence_wire::{Message, NeighborStructure, RejectCode};

use crate::RtiConfig;

/// Outbound side of one federate's connection
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
    ip: IpAddr,
    /// Port of the federate's server for peer-to-peer connections, -1 if unknown
    advertised_port: i32,
    /// Where runtime clock sync datagrams go
    clock_sync_addr: Option<SocketAddr>,
}

pub(crate) struct FederationState {
    pub(crate) ctx: FederationContext,
    sessions: Vec<Option<SessionHandle>>,
    ever_connected: Vec<bool>,
    start_proposals: Vec<Option<Instant>>,
    start_time: Option<Instant>,
}

impl FederationState {
    /// Queue a message for a federate; dropped if it is not connected.
    pub(crate) fn send(&self, target: FederateId, msg: Message) {
        match self.sessions.get(target.index()).and_then(Option::as_ref) {
            Some(session) => {
                if session.tx.send(msg).is_err() {
                    tracing::debug!(federate = %target, "writer already closed, dropping message");
                }
            }
            None => {
                tracing::debug!(federate = %target, message = msg.name(), "federate not connected, dropping message");
            }
        }
    }

    /// Deliver engine output in order
    pub(crate) fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            let msg = match notice.kind {
                NoticeKind::Grant(grant) if grant.is_provisional => {
                    Message::ProvisionalTagAdvanceGrant(grant.tag)
                }
                NoticeKind::Grant(grant) => Message::TagAdvanceGrant(grant.tag),
                NoticeKind::StopRequest(tag) => Message::StopRequest(tag),
                NoticeKind::StopGranted(tag) => Message::StopGranted(tag),
            };
            self.send(notice.target, msg);
        }
    }

    pub(crate) fn is_connected(&self, id: FederateId) -> bool {
        matches!(self.sessions.get(id.index()), Some(Some(_)))
    }

    pub(crate) fn advertise(&mut self, id: FederateId, port: i32) {
        if let Some(Some(session)) = self.sessions.get_mut(id.index()) {
            session.advertised_port = port;
        }
    }

    /// Advertised server address of `id`; port -1 when not yet known
    pub(crate) fn address_of(&self, id: FederateId) -> (i32, Ipv4Addr) {
        match self.sessions.get(id.index()).and_then(Option::as_ref) {
            Some(SessionHandle {
                advertised_port,
                ip: IpAddr::V4(ip),
                ..
            }) => (*advertised_port, *ip),
            Some(session) if session.advertised_port >= 0 => {
                tracing::warn!(federate = %id, ip = %session.ip, "federate address is not IPv4");
                (-1, Ipv4Addr::UNSPECIFIED)
            }
            _ => (-1, Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Record a start time proposal; once every federate has proposed, send
    /// all of them the agreed start.
    pub(crate) fn propose_start(&mut self, id: FederateId, proposal: Instant, delay: Interval) {
        if let Some(start) = self.start_time {
            // Joined after the start was agreed
            self.send(id, Message::Timestamp(start));
            return;
        }
        self.start_proposals[id.index()] = Some(proposal);
        let received = self.start_proposals.iter().filter(|p| p.is_some()).count();
        tracing::debug!(federate = %id, proposal, received, "start time proposal");
        if received < self.start_proposals.len() {
            return;
        }

        let latest = self.start_proposals.iter().flatten().copied().max().unwrap_or(proposal);
        let start = latest.saturating_add(delay);
        self.start_time = Some(start);
        tracing::info!(start_time = start, "federation start time agreed");
        for i in 0..self.sessions.len() {
            self.send(FederateId::from(i), Message::Timestamp(start));
        }
    }
}

/// Shared RTI state
pub struct Federation {
    config: RtiConfig,
    clock: Arc<dyn PhysicalClock>,
    state: Mutex<FederationState>,
    finished: Notify,
}

impl Federation {
    pub fn new(config: RtiConfig, clock: Arc<dyn PhysicalClock>) -> Self {
        let n = config.number_of_federates as usize;
        Federation {
            state: Mutex::new(FederationState {
                ctx: FederationContext::with_policy(n, config.disconnect_policy),
                sessions: (0..n).map(|_| None).collect(),
                ever_connected: vec![false; n],
                start_proposals: vec![None; n],
                start_time: None,
            }),
            config,
            clock,
            finished: Notify::new(),
        }
    }

    pub fn config(&self) -> &RtiConfig {
        &self.config
    }

    /// RTI physical time in nanoseconds
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FederationState> {
        self.state.lock()
    }

    /// Run `f` against the coordination state
    pub fn with_context<R>(&self, f: impl FnOnce(&FederationContext) -> R) -> R {
        f(&self.state.lock().ctx)
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.state.lock().start_time
    }

    pub fn connected_federates(&self) -> Vec<FederateId> {
        let state = self.state.lock();
        (0..state.sessions.len())
            .map(FederateId::from)
            .filter(|id| state.is_connected(*id))
            .collect()
    }

    /// Validate a FED_IDS and reserve the federate's slot.
    pub(crate) fn claim(
        &self,
        id: FederateId,
        federation_id: &str,
        ip: IpAddr,
    ) -> Result<mpsc::UnboundedReceiver<Message>, RejectCode> {
        if federation_id != self.config.federation_id {
            return Err(RejectCode::FederationIdDoesNotMatch);
        }
        let mut state = self.state.lock();
        if id.index() >= state.sessions.len() {
            return Err(RejectCode::FederateIdOutOfRange);
        }
        if state.is_connected(id) {
            return Err(RejectCode::FederateIdInUse);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions[id.index()] = Some(SessionHandle {
            tx,
            ip,
            advertised_port: -1,
            clock_sync_addr: None,
        });
        state.ever_connected[id.index()] = true;
        if let Err(e) = state.ctx.federate_connected(id) {
            tracing::error!(federate = %id, error = %e, "slot reserved for unknown federate");
        }
        Ok(rx)
    }

    pub(crate) fn set_neighbors(&self, id: FederateId, neighbors: &NeighborStructure) {
        let mut state = self.state.lock();
        let result = state.ctx.set_neighbor_structure(
            id,
            neighbors.upstream_delay_tags(),
            neighbors.downstream.iter().copied(),
        );
        match result {
            Ok(()) => tracing::debug!(
                federate = %id,
                upstream = neighbors.upstream.len(),
                downstream = neighbors.downstream.len(),
                "neighbor structure"
            ),
            Err(e) => tracing::warn!(federate = %id, error = %e, "ignoring neighbor structure"),
        }
    }

    pub(crate) fn set_clock_sync_addr(&self, id: FederateId, addr: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(Some(session)) = state.sessions.get_mut(id.index()) {
            session.clock_sync_addr = Some(addr);
        }
    }

    /// Federates currently enrolled in runtime clock sync
    pub(crate) fn clock_sync_targets(&self) -> Vec<(FederateId, SocketAddr)> {
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let addr = s.as_ref()?.clock_sync_addr?;
                Some((FederateId::from(i), addr))
            })
            .collect()
    }

    /// Tear down a federate's session and let the engine route around it.
    pub(crate) fn release(&self, id: FederateId) {
        let mut state = self.state.lock();
        let Some(slot) = state.sessions.get_mut(id.index()) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        match state.ctx.federate_disconnected(id) {
            Ok(notices) => state.dispatch(notices),
            Err(e) => tracing::warn!(federate = %id, error = %e, "disconnect"),
        }

        let all_done = state.ever_connected.iter().all(|c| *c)
            && state.sessions.iter().all(Option::is_none);
        if all_done {
            tracing::info!("all federates have left");
            self.finished.notify_one();
        }
    }

    /// Resolves once every federate has connected and left again
    pub async fn finished(&self) {
        self.finished.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Tag;
    use cadence_time::ManualClock;

    fn federation(n: u16) -> Federation {
        let config = RtiConfig {
            number_of_federates: n,
            federation_id: "fed".into(),
            ..RtiConfig::default()
        };
        Federation::new(config, Arc::new(ManualClock::new(0)))
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_claim_validation() {
        let fed = federation(2);
        assert_eq!(
            fed.claim(FederateId::new(0), "other", localhost()).unwrap_err(),
            RejectCode::FederationIdDoesNotMatch
        );
        assert_eq!(
            fed.claim(FederateId::new(2), "fed", localhost()).unwrap_err(),
            RejectCode::FederateIdOutOfRange
        );
        let _rx = fed.claim(FederateId::new(0), "fed", localhost()).unwrap();
        assert_eq!(
            fed.claim(FederateId::new(0), "fed", localhost()).unwrap_err(),
            RejectCode::FederateIdInUse
        );
        assert_eq!(fed.connected_federates(), vec![FederateId::new(0)]);
    }

    #[test]
    fn test_start_time_sent_once_all_proposed() {
        let fed = federation(2);
        let mut rx0 = fed.claim(FederateId::new(0), "fed", localhost()).unwrap();
        let mut rx1 = fed.claim(FederateId::new(1), "fed", localhost()).unwrap();

        fed.lock().propose_start(FederateId::new(0), 100, 1_000);
        assert!(rx0.try_recv().is_err());

        fed.lock().propose_start(FederateId::new(1), 300, 1_000);
        assert_eq!(rx0.try_recv().unwrap(), Message::Timestamp(1_300));
        assert_eq!(rx1.try_recv().unwrap(), Message::Timestamp(1_300));
        assert_eq!(fed.start_time(), Some(1_300));
    }

    #[test]
    fn test_release_notifies_downstream_and_finishes() {
        let fed = federation(2);
        let _rx0 = fed.claim(FederateId::new(0), "fed", localhost()).unwrap();
        let mut rx1 = fed.claim(FederateId::new(1), "fed", localhost()).unwrap();
        fed.set_neighbors(
            FederateId::new(1),
            &NeighborStructure {
                upstream: vec![(FederateId::new(0), 5)],
                downstream: vec![],
            },
        );
        {
            let mut state = fed.lock();
            let notices = state
                .ctx
                .update_federate_next_event_tag_locked(FederateId::new(1), Tag::new(50, 0))
                .unwrap();
            state.dispatch(notices);
        }
        assert!(rx1.try_recv().is_err());

        fed.release(FederateId::new(0));
        assert_eq!(rx1.try_recv().unwrap(), Message::TagAdvanceGrant(Tag::new(50, 0)));
        assert_eq!(fed.connected_federates(), vec![FederateId::new(1)]);
    }

    #[test]
    fn test_address_query_answers() {
        let fed = federation(2);
        let _rx = fed.claim(FederateId::new(0), "fed", localhost()).unwrap();
        assert_eq!(fed.lock().address_of(FederateId::new(0)), (-1, Ipv4Addr::LOCALHOST));
        fed.lock().advertise(FederateId::new(0), 40_000);
        assert_eq!(fed.lock().address_of(FederateId::new(0)), (40_000, Ipv4Addr::LOCALHOST));
        assert_eq!(fed.lock().address_of(FederateId::new(1)), (-1, Ipv4Addr::UNSPECIFIED));
    }
}
