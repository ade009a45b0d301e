//! Rejection codes sent in a REJECT message during the handshake

/// Reason the RTI refused a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    /// Federation id in FED_IDS differs from the RTI's
    FederationIdDoesNotMatch = 1,
    /// Another federate already registered with this id
    FederateIdInUse = 2,
    /// Federate id is not below the configured federate count
    FederateIdOutOfRange = 3,
    /// First message was not the one the handshake expects
    UnexpectedMessage = 4,
    /// Peer answered with something other than an RTI message
    WrongServer = 5,
    HmacDoesNotMatch = 6,
    RtiNotExecutedWithAuth = 7,
}

impl RejectCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(RejectCode::FederationIdDoesNotMatch),
            2 => Some(RejectCode::FederateIdInUse),
            3 => Some(RejectCode::FederateIdOutOfRange),
            4 => Some(RejectCode::UnexpectedMessage),
            5 => Some(RejectCode::WrongServer),
            6 => Some(RejectCode::HmacDoesNotMatch),
            7 => Some(RejectCode::RtiNotExecutedWithAuth),
            _ => None,
        }
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            RejectCode::FederationIdDoesNotMatch => "federation id does not match",
            RejectCode::FederateIdInUse => "federate id in use",
            RejectCode::FederateIdOutOfRange => "federate id out of range",
            RejectCode::UnexpectedMessage => "unexpected message",
            RejectCode::WrongServer => "connected to the wrong server",
            RejectCode::HmacDoesNotMatch => "HMAC does not match",
            RejectCode::RtiNotExecutedWithAuth => "RTI not executed with authentication",
        }
    }
}
