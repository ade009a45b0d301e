//! Two-phase stop coordination
//!
//! The first request opens a round: the requester votes, every other
//! connected federate is asked for its earliest acceptable stop tag, and the
//! maximum over all votes becomes the stop tag once everyone has answered.
//! Disconnected federates never object. The grant is broadcast once.

use cadence_core::{FederateId, Tag};

use crate::{CoordResult, FederationContext, Notice, NoticeKind};

#[derive(Debug, Clone)]
pub struct StopCoordinator {
    max_stop_tag: Tag,
    in_progress: bool,
    granted: Option<Tag>,
}

impl Default for StopCoordinator {
    fn default() -> Self {
        StopCoordinator {
            max_stop_tag: Tag::NEVER,
            in_progress: false,
            granted: None,
        }
    }
}

impl StopCoordinator {
    /// Largest candidate seen in the current round
    pub fn max_stop_tag(&self) -> Tag {
        self.max_stop_tag
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn granted(&self) -> Option<Tag> {
        self.granted
    }
}

impl FederationContext {
    /// The agreed stop tag, FOREVER until a stop is granted
    pub fn stop_tag(&self) -> Tag {
        self.stop.granted.unwrap_or(Tag::FOREVER)
    }

    pub fn stop_coordinator(&self) -> &StopCoordinator {
        &self.stop
    }

    /// A federate asked to stop at `tag`.
    pub fn handle_stop_request(&mut self, id: FederateId, tag: Tag) -> CoordResult<Vec<Notice>> {
        self.check(id)?;
        if self.stop.granted.is_some() {
            tracing::debug!(federate = %id, tag = %tag, "stop already granted, ignoring request");
            return Ok(Vec::new());
        }

        if !self.stop.in_progress {
            tracing::info!(federate = %id, tag = %tag, "stop requested");
            self.stop.in_progress = true;
            self.stop.max_stop_tag = self.stop.max_stop_tag.max(tag);
            self.nodes[id.index()].requested_stop = true;
            for node in &mut self.nodes {
                if !node.is_connected() {
                    node.requested_stop = true;
                }
            }
            if self.all_voted() {
                return Ok(self.broadcast_stop_granted());
            }
            let max = self.stop.max_stop_tag;
            return Ok(self
                .nodes
                .iter()
                .filter(|node| node.is_connected() && !node.requested_stop)
                .map(|node| Notice {
                    target: node.id,
                    kind: NoticeKind::StopRequest(max),
                })
                .collect());
        }

        // A second request during an open round counts as that federate's reply
        self.handle_stop_request_reply(id, tag)
    }

    /// A federate answered an outstanding stop request with its candidate.
    pub fn handle_stop_request_reply(&mut self, id: FederateId, tag: Tag) -> CoordResult<Vec<Notice>> {
        self.check(id)?;
        if self.stop.granted.is_some() {
            return Ok(Vec::new());
        }
        if !self.stop.in_progress {
            tracing::warn!(federate = %id, tag = %tag, "stop reply without an open stop round");
            return Ok(Vec::new());
        }

        tracing::debug!(federate = %id, tag = %tag, "stop reply");
        self.stop.max_stop_tag = self.stop.max_stop_tag.max(tag);
        self.nodes[id.index()].requested_stop = true;
        Ok(self.grant_if_all_voted())
    }

    /// Finish an open round with whatever votes have arrived.
    pub fn force_stop_grant(&mut self) -> Vec<Notice> {
        if !self.stop.in_progress || self.stop.granted.is_some() {
            return Vec::new();
        }
        let missing: Vec<FederateId> = self
            .nodes
            .iter()
            .filter(|node| node.is_connected() && !node.requested_stop)
            .map(|node| node.id)
            .collect();
        tracing::warn!(?missing, tag = %self.stop.max_stop_tag, "stop replies timed out, granting anyway");
        self.broadcast_stop_granted()
    }

    /// Called when `id` leaves; an open round stops waiting for it.
    pub(crate) fn stop_vote_on_disconnect(&mut self, id: FederateId) -> Vec<Notice> {
        if !self.stop.in_progress || self.stop.granted.is_some() {
            return Vec::new();
        }
        self.nodes[id.index()].requested_stop = true;
        self.grant_if_all_voted()
    }

    fn all_voted(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.requested_stop || !node.is_connected())
    }

    fn grant_if_all_voted(&mut self) -> Vec<Notice> {
        if self.all_voted() {
            self.broadcast_stop_granted()
        } else {
            Vec::new()
        }
    }

    fn broadcast_stop_granted(&mut self) -> Vec<Notice> {
        let tag = self.stop.max_stop_tag;
        self.stop.granted = Some(tag);
        self.stop.in_progress = false;
        tracing::info!(tag = %tag, "stop granted");

        let mut notices = Vec::new();
        for node in &mut self.nodes {
            node.requested_stop = false;
            if !node.is_connected() {
                continue;
            }
            node.next_event = node.next_event.min(tag);
            notices.push(Notice {
                target: node.id,
                kind: NoticeKind::StopGranted(tag),
            });
        }
        notices
    }
}
