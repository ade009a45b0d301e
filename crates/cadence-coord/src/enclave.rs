//! In-process coordination between enclaves
//!
//! Enclaves are federates that share a process and talk to the coordinator
//! through function calls instead of sockets. Each enclave thread blocks on
//! its own condition variable until the engine grants it a tag covering its
//! request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::{FederateId, Tag};
use parking_lot::{Condvar, Mutex};

use crate::{
    CoordError, CoordResult, DisconnectPolicy, FederationContext, Notice, NoticeKind,
    TagAdvanceGrant,
};

struct EnclaveState {
    ctx: FederationContext,
    /// Stop candidates forwarded to each enclave and not yet answered
    stop_requests: Vec<Option<Tag>>,
}

struct Shared {
    state: Mutex<EnclaveState>,
    wakers: Vec<Condvar>,
}

/// Shared handle; clone it into every enclave thread
#[derive(Clone)]
pub struct EnclaveCoordinator {
    shared: Arc<Shared>,
}

impl EnclaveCoordinator {
    pub fn new(size: usize) -> Self {
        Self::from_context(FederationContext::with_policy(size, DisconnectPolicy::default()))
    }

    /// Wrap an already configured context
    pub fn from_context(ctx: FederationContext) -> Self {
        let size = ctx.len();
        EnclaveCoordinator {
            shared: Arc::new(Shared {
                state: Mutex::new(EnclaveState {
                    ctx,
                    stop_requests: vec![None; size],
                }),
                wakers: (0..size).map(|_| Condvar::new()).collect(),
            }),
        }
    }

    pub fn add_connection(&self, from: FederateId, to: FederateId, delay: Tag) -> CoordResult<()> {
        self.shared.state.lock().ctx.add_connection(from, to, delay)
    }

    pub fn connect(&self, id: FederateId) -> CoordResult<()> {
        self.shared.state.lock().ctx.federate_connected(id)
    }

    /// Report the next event of `id` and block until it may advance.
    pub fn next_event_tag(&self, id: FederateId, next_event: Tag) -> CoordResult<TagAdvanceGrant> {
        let mut state = self.shared.state.lock();
        let notices = state.ctx.update_federate_next_event_tag_locked(id, next_event)?;
        self.deliver(&mut state, notices);

        loop {
            if let Some(grant) = Self::covering_grant(&state.ctx, id, next_event)? {
                return Ok(grant);
            }
            self.shared.wakers[id.index()].wait(&mut state);
        }
    }

    /// Like [`Self::next_event_tag`], giving up after `timeout`.
    pub fn next_event_tag_timeout(
        &self,
        id: FederateId,
        next_event: Tag,
        timeout: Duration,
    ) -> CoordResult<Option<TagAdvanceGrant>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        let notices = state.ctx.update_federate_next_event_tag_locked(id, next_event)?;
        self.deliver(&mut state, notices);

        loop {
            if let Some(grant) = Self::covering_grant(&state.ctx, id, next_event)? {
                return Ok(Some(grant));
            }
            if self.shared.wakers[id.index()]
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Self::covering_grant(&state.ctx, id, next_event);
            }
        }
    }

    pub fn logical_tag_complete(&self, id: FederateId, tag: Tag) -> CoordResult<()> {
        let mut state = self.shared.state.lock();
        let notices = state.ctx.logical_tag_complete(id, tag)?;
        self.deliver(&mut state, notices);
        Ok(())
    }

    /// Leave the federation; downstream enclaves stop waiting on `id`.
    pub fn resign(&self, id: FederateId) -> CoordResult<()> {
        let mut state = self.shared.state.lock();
        let notices = state.ctx.federate_disconnected(id)?;
        self.deliver(&mut state, notices);
        self.shared.wakers[id.index()].notify_all();
        Ok(())
    }

    pub fn request_stop(&self, id: FederateId, tag: Tag) -> CoordResult<()> {
        let mut state = self.shared.state.lock();
        let notices = state.ctx.handle_stop_request(id, tag)?;
        state.stop_requests[id.index()] = None;
        self.deliver(&mut state, notices);
        Ok(())
    }

    /// Stop candidate this enclave has been asked to answer, if any
    pub fn take_stop_request(&self, id: FederateId) -> Option<Tag> {
        self.shared
            .state
            .lock()
            .stop_requests
            .get_mut(id.index())
            .and_then(Option::take)
    }

    pub fn reply_stop(&self, id: FederateId, tag: Tag) -> CoordResult<()> {
        let mut state = self.shared.state.lock();
        let notices = state.ctx.handle_stop_request_reply(id, tag)?;
        self.deliver(&mut state, notices);
        Ok(())
    }

    pub fn stop_tag(&self) -> Tag {
        self.shared.state.lock().ctx.stop_tag()
    }

    /// Grant already held by `id` that lets it advance to `next_event`,
    /// or to the stop tag if that comes first
    fn covering_grant(
        ctx: &FederationContext,
        id: FederateId,
        next_event: Tag,
    ) -> CoordResult<Option<TagAdvanceGrant>> {
        let node = ctx.node(id).ok_or(CoordError::UnknownFederate(id))?;
        if !node.is_connected() {
            return Err(CoordError::NotConnected(id));
        }
        let target = next_event.min(ctx.stop_tag());
        if node.last_granted >= target {
            Ok(Some(TagAdvanceGrant::tag(node.last_granted)))
        } else if node.last_provisionally_granted >= target {
            Ok(Some(TagAdvanceGrant::provisional(node.last_provisionally_granted)))
        } else {
            Ok(None)
        }
    }

    fn deliver(&self, state: &mut EnclaveState, notices: Vec<Notice>) {
        for notice in notices {
            let index = notice.target.index();
            match notice.kind {
                NoticeKind::Grant(_) => {}
                NoticeKind::StopRequest(tag) => state.stop_requests[index] = Some(tag),
                NoticeKind::StopGranted(_) => state.stop_requests[index] = None,
            }
            self.shared.wakers[index].notify_all();
        }
    }
}
