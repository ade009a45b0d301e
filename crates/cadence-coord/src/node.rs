//! Scheduling state of a single federate (or enclave)

use cadence_core::{FederateId, Tag};
use serde::{Deserialize, Serialize};

/// Connection and grant state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    NotConnected,
    /// Reported a next event that has not been answered with a grant yet
    Pending,
    /// Holds a grant for its latest request
    Granted,
}

/// How a federate relates logical time to physical time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Logical time advances as fast as possible
    Fast,
    /// Logical time is paced by physical time
    #[default]
    Realtime,
}

/// A tag advance grant: final (TAG) or provisional (PTAG)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TagAdvanceGrant {
    pub tag: Tag,
    pub is_provisional: bool,
}

impl TagAdvanceGrant {
    pub fn tag(tag: Tag) -> Self {
        TagAdvanceGrant {
            tag,
            is_provisional: false,
        }
    }

    pub fn provisional(tag: Tag) -> Self {
        TagAdvanceGrant {
            tag,
            is_provisional: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulingNode {
    pub id: FederateId,
    pub state: NodeState,
    /// Latest tag the node reported complete (LTC)
    pub completed: Tag,
    /// Earliest unprocessed event the node reported (NET)
    pub next_event: Tag,
    pub last_granted: Tag,
    pub last_provisionally_granted: Tag,
    pub mode: ExecutionMode,
    /// Has voted in the current stop round
    pub requested_stop: bool,
}

impl SchedulingNode {
    pub fn new(id: FederateId) -> Self {
        SchedulingNode {
            id,
            state: NodeState::NotConnected,
            completed: Tag::NEVER,
            next_event: Tag::NEVER,
            last_granted: Tag::NEVER,
            last_provisionally_granted: Tag::NEVER,
            mode: ExecutionMode::default(),
            requested_stop: false,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state != NodeState::NotConnected
    }

    /// Record a grant that is being sent to the node
    pub fn record_grant(&mut self, grant: TagAdvanceGrant) {
        if grant.is_provisional {
            self.last_provisionally_granted = grant.tag;
        } else {
            self.last_granted = grant.tag;
        }
        self.state = NodeState::Granted;
    }

    /// Back to the freshly registered state, keeping the identity
    pub fn reset(&mut self) {
        *self = SchedulingNode {
            mode: self.mode,
            ..SchedulingNode::new(self.id)
        };
    }
}
