//! Coordination errors

use cadence_core::{FederateId, Tag};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("Unknown federate {0}")]
    UnknownFederate(FederateId),

    #[error("Federate {0} is not connected")]
    NotConnected(FederateId),

    /// A federate reported a next event earlier than a final grant it holds
    #[error("Federate {federate} reported next event {tag} after being granted {granted}")]
    OutOfOrderTag {
        federate: FederateId,
        tag: Tag,
        granted: Tag,
    },
}

pub type CoordResult<T> = Result<T, CoordError>;
