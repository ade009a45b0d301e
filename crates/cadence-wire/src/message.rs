//! Messages exchanged between federates and the RTI
//!
//! Layouts (after the one-byte type code, all integers little-endian):
//! - tag payloads: i64 time, u32 microstep
//! - FED_IDS / P2P_SENDING_FED_ID: u16 federate, u8 length, federation id
//! - MESSAGE / P2P_MESSAGE: u16 port, u16 federate, u32 length, bytes
//! - TAGGED_MESSAGE / P2P_TAGGED_MESSAGE: u16 port, u16 federate, u32 length, tag, bytes
//! - PORT_ABSENT: u16 port, u16 federate, tag
//! - NEIGHBOR_STRUCTURE: u32 upstream count, u32 downstream count,
//!   (u16 id, i64 delay) per upstream, u16 id per downstream

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use cadence_core::{CadenceError, CadenceResult, FederateId, Instant, Interval, Tag, TAG_SIZE};

use crate::{extract_u16, extract_u32, RejectCode, WireReader};

/// Largest payload accepted in a length-prefixed message
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Size of the fixed part of NEIGHBOR_STRUCTURE, type byte included
pub const NEIGHBOR_STRUCTURE_HEADER_SIZE: usize = 9;

/// UDP_PORT value announcing that the federate takes no part in clock sync
pub const NO_CLOCK_SYNC_PORT: u16 = u16::MAX;

/// Delay sent in NEIGHBOR_STRUCTURE for a connection without `after`
pub const NO_DELAY: Interval = i64::MIN;

/// Message type codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Reject = 0,
    FedIds = 1,
    Timestamp = 2,
    Message = 3,
    Resign = 4,
    TaggedMessage = 5,
    NextEventTag = 6,
    TagAdvanceGrant = 7,
    ProvisionalTagAdvanceGrant = 8,
    LatestTagComplete = 9,
    StopRequest = 10,
    StopRequestReply = 11,
    StopGranted = 12,
    AddressQuery = 13,
    AddressQueryReply = 14,
    AddressAdvertisement = 15,
    P2pSendingFedId = 16,
    P2pMessage = 17,
    P2pTaggedMessage = 18,
    ClockSyncT1 = 19,
    ClockSyncT3 = 20,
    ClockSyncT4 = 21,
    ClockSyncCodedProbe = 22,
    PortAbsent = 23,
    NeighborStructure = 24,
    Failed = 25,
    UdpPort = 254,
    Ack = 255,
}

impl MessageType {
    pub fn from_u8(code: u8) -> Option<Self> {
        let ty = match code {
            0 => Self::Reject,
            1 => Self::FedIds,
            2 => Self::Timestamp,
            3 => Self::Message,
            4 => Self::Resign,
            5 => Self::TaggedMessage,
            6 => Self::NextEventTag,
            7 => Self::TagAdvanceGrant,
            8 => Self::ProvisionalTagAdvanceGrant,
            9 => Self::LatestTagComplete,
            10 => Self::StopRequest,
            11 => Self::StopRequestReply,
            12 => Self::StopGranted,
            13 => Self::AddressQuery,
            14 => Self::AddressQueryReply,
            15 => Self::AddressAdvertisement,
            16 => Self::P2pSendingFedId,
            17 => Self::P2pMessage,
            18 => Self::P2pTaggedMessage,
            19 => Self::ClockSyncT1,
            20 => Self::ClockSyncT3,
            21 => Self::ClockSyncT4,
            22 => Self::ClockSyncCodedProbe,
            23 => Self::PortAbsent,
            24 => Self::NeighborStructure,
            25 => Self::Failed,
            254 => Self::UdpPort,
            255 => Self::Ack,
            _ => return None,
        };
        Some(ty)
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Reject => "REJECT",
            Self::FedIds => "FED_IDS",
            Self::Timestamp => "TIMESTAMP",
            Self::Message => "MESSAGE",
            Self::Resign => "RESIGN",
            Self::TaggedMessage => "TAGGED_MESSAGE",
            Self::NextEventTag => "NEXT_EVENT_TAG",
            Self::TagAdvanceGrant => "TAG_ADVANCE_GRANT",
            Self::ProvisionalTagAdvanceGrant => "PROVISIONAL_TAG_ADVANCE_GRANT",
            Self::LatestTagComplete => "LATEST_TAG_COMPLETE",
            Self::StopRequest => "STOP_REQUEST",
            Self::StopRequestReply => "STOP_REQUEST_REPLY",
            Self::StopGranted => "STOP_GRANTED",
            Self::AddressQuery => "ADDRESS_QUERY",
            Self::AddressQueryReply => "ADDRESS_QUERY_REPLY",
            Self::AddressAdvertisement => "ADDRESS_ADVERTISEMENT",
            Self::P2pSendingFedId => "P2P_SENDING_FED_ID",
            Self::P2pMessage => "P2P_MESSAGE",
            Self::P2pTaggedMessage => "P2P_TAGGED_MESSAGE",
            Self::ClockSyncT1 => "CLOCK_SYNC_T1",
            Self::ClockSyncT3 => "CLOCK_SYNC_T3",
            Self::ClockSyncT4 => "CLOCK_SYNC_T4",
            Self::ClockSyncCodedProbe => "CLOCK_SYNC_CODED_PROBE",
            Self::PortAbsent => "PORT_ABSENT",
            Self::NeighborStructure => "NEIGHBOR_STRUCTURE",
            Self::Failed => "FAILED",
            Self::UdpPort => "UDP_PORT",
            Self::Ack => "ACK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Untagged payload addressed to a federate input port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataMessage {
    pub port: u16,
    pub federate: FederateId,
    pub payload: Bytes,
}

/// Payload carrying the logical tag at which it must be delivered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedMessage {
    pub port: u16,
    pub federate: FederateId,
    pub tag: Tag,
    pub payload: Bytes,
}

/// A federate's immediate neighbors, sent once after FED_IDS
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighborStructure {
    /// Upstream federates with the `after` delay of the connection
    /// ([`NO_DELAY`] when the connection has none)
    pub upstream: Vec<(FederateId, Interval)>,
    pub downstream: Vec<FederateId>,
}

impl NeighborStructure {
    /// Upstream neighbors with their delays converted to delay tags
    pub fn upstream_delay_tags(&self) -> impl Iterator<Item = (FederateId, Tag)> + '_ {
        self.upstream.iter().map(|&(id, delay)| {
            let after = if delay == NO_DELAY { None } else { Some(delay) };
            (id, Tag::from_connection_delay(after))
        })
    }
}

/// A decoded protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Reject(RejectCode),
    Ack,
    /// UDP port for runtime clock sync, [`NO_CLOCK_SYNC_PORT`] when disabled
    UdpPort(u16),
    FedIds {
        federate: FederateId,
        federation_id: String,
    },
    Timestamp(Instant),
    Data(DataMessage),
    Resign,
    Tagged(TaggedMessage),
    NextEventTag(Tag),
    TagAdvanceGrant(Tag),
    ProvisionalTagAdvanceGrant(Tag),
    LatestTagComplete(Tag),
    StopRequest(Tag),
    StopRequestReply(Tag),
    StopGranted(Tag),
    AddressQuery(FederateId),
    /// Port -1 means the address is not known yet
    AddressQueryReply {
        port: i32,
        addr: Ipv4Addr,
    },
    AddressAdvertisement(i32),
    P2pSendingFedId {
        federate: FederateId,
        federation_id: String,
    },
    P2pData(DataMessage),
    P2pTagged(TaggedMessage),
    ClockSyncT1(Instant),
    ClockSyncT3(FederateId),
    ClockSyncT4(Instant),
    ClockSyncCodedProbe(Instant),
    PortAbsent {
        port: u16,
        federate: FederateId,
        tag: Tag,
    },
    NeighborStructure(NeighborStructure),
    Failed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Reject(_) => MessageType::Reject,
            Message::Ack => MessageType::Ack,
            Message::UdpPort(_) => MessageType::UdpPort,
            Message::FedIds { .. } => MessageType::FedIds,
            Message::Timestamp(_) => MessageType::Timestamp,
            Message::Data(_) => MessageType::Message,
            Message::Resign => MessageType::Resign,
            Message::Tagged(_) => MessageType::TaggedMessage,
            Message::NextEventTag(_) => MessageType::NextEventTag,
            Message::TagAdvanceGrant(_) => MessageType::TagAdvanceGrant,
            Message::ProvisionalTagAdvanceGrant(_) => MessageType::ProvisionalTagAdvanceGrant,
            Message::LatestTagComplete(_) => MessageType::LatestTagComplete,
            Message::StopRequest(_) => MessageType::StopRequest,
            Message::StopRequestReply(_) => MessageType::StopRequestReply,
            Message::StopGranted(_) => MessageType::StopGranted,
            Message::AddressQuery(_) => MessageType::AddressQuery,
            Message::AddressQueryReply { .. } => MessageType::AddressQueryReply,
            Message::AddressAdvertisement(_) => MessageType::AddressAdvertisement,
            Message::P2pSendingFedId { .. } => MessageType::P2pSendingFedId,
            Message::P2pData(_) => MessageType::P2pMessage,
            Message::P2pTagged(_) => MessageType::P2pTaggedMessage,
            Message::ClockSyncT1(_) => MessageType::ClockSyncT1,
            Message::ClockSyncT3(_) => MessageType::ClockSyncT3,
            Message::ClockSyncT4(_) => MessageType::ClockSyncT4,
            Message::ClockSyncCodedProbe(_) => MessageType::ClockSyncCodedProbe,
            Message::PortAbsent { .. } => MessageType::PortAbsent,
            Message::NeighborStructure(_) => MessageType::NeighborStructure,
            Message::Failed => MessageType::Failed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.message_type().name()
    }

    /// Append the wire encoding to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type().to_u8());
        match self {
            Message::Reject(code) => buf.put_u8(code.to_u8()),
            Message::Ack | Message::Resign | Message::Failed => {}
            Message::UdpPort(port) => buf.put_u16_le(*port),
            Message::FedIds {
                federate,
                federation_id,
            }
            | Message::P2pSendingFedId {
                federate,
                federation_id,
            } => {
                let id = federation_id.as_bytes();
                // Length is one byte; longer ids are truncated
                let len = id.len().min(u8::MAX as usize);
                buf.put_u16_le(federate.0);
                buf.put_u8(len as u8);
                buf.put_slice(&id[..len]);
            }
            Message::Timestamp(t)
            | Message::ClockSyncT1(t)
            | Message::ClockSyncT4(t)
            | Message::ClockSyncCodedProbe(t) => buf.put_i64_le(*t),
            Message::Data(msg) | Message::P2pData(msg) => {
                buf.put_u16_le(msg.port);
                buf.put_u16_le(msg.federate.0);
                buf.put_u32_le(msg.payload.len() as u32);
                buf.put_slice(&msg.payload);
            }
            Message::Tagged(msg) | Message::P2pTagged(msg) => {
                buf.put_u16_le(msg.port);
                buf.put_u16_le(msg.federate.0);
                buf.put_u32_le(msg.payload.len() as u32);
                msg.tag.write_to(buf);
                buf.put_slice(&msg.payload);
            }
            Message::NextEventTag(tag)
            | Message::TagAdvanceGrant(tag)
            | Message::ProvisionalTagAdvanceGrant(tag)
            | Message::LatestTagComplete(tag)
            | Message::StopRequest(tag)
            | Message::StopRequestReply(tag)
            | Message::StopGranted(tag) => tag.write_to(buf),
            Message::AddressQuery(federate) | Message::ClockSyncT3(federate) => {
                buf.put_u16_le(federate.0)
            }
            Message::AddressQueryReply { port, addr } => {
                buf.put_i32_le(*port);
                buf.put_slice(&addr.octets());
            }
            Message::AddressAdvertisement(port) => buf.put_i32_le(*port),
            Message::PortAbsent {
                port,
                federate,
                tag,
            } => {
                buf.put_u16_le(*port);
                buf.put_u16_le(federate.0);
                tag.write_to(buf);
            }
            Message::NeighborStructure(ns) => {
                buf.put_u32_le(ns.upstream.len() as u32);
                buf.put_u32_le(ns.downstream.len() as u32);
                for (id, delay) in &ns.upstream {
                    buf.put_u16_le(id.0);
                    buf.put_i64_le(*delay);
                }
                for id in &ns.downstream {
                    buf.put_u16_le(id.0);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Total encoded length of the message at the front of `buf`, or `None`
    /// if more bytes are needed to tell.
    pub fn frame_len(buf: &[u8]) -> CadenceResult<Option<usize>> {
        let Some(&code) = buf.first() else {
            return Ok(None);
        };
        let ty = MessageType::from_u8(code).ok_or(CadenceError::UnknownMessageType(code))?;

        let len = match ty {
            MessageType::Ack | MessageType::Resign | MessageType::Failed => 1,
            MessageType::Reject => 2,
            MessageType::UdpPort | MessageType::AddressQuery | MessageType::ClockSyncT3 => 3,
            MessageType::AddressAdvertisement => 5,
            MessageType::Timestamp
            | MessageType::ClockSyncT1
            | MessageType::ClockSyncT4
            | MessageType::ClockSyncCodedProbe
            | MessageType::AddressQueryReply => 9,
            MessageType::NextEventTag
            | MessageType::TagAdvanceGrant
            | MessageType::ProvisionalTagAdvanceGrant
            | MessageType::LatestTagComplete
            | MessageType::StopRequest
            | MessageType::StopRequestReply
            | MessageType::StopGranted => 1 + TAG_SIZE,
            MessageType::PortAbsent => 5 + TAG_SIZE,
            MessageType::FedIds | MessageType::P2pSendingFedId => match buf.get(3) {
                Some(&n) => 4 + n as usize,
                None => return Ok(None),
            },
            MessageType::Message | MessageType::P2pMessage => match extract_u32(buf, 5) {
                Some(n) => 9 + checked_payload_len(n)?,
                None => return Ok(None),
            },
            MessageType::TaggedMessage | MessageType::P2pTaggedMessage => {
                match extract_u32(buf, 5) {
                    Some(n) => 9 + TAG_SIZE + checked_payload_len(n)?,
                    None => return Ok(None),
                }
            }
            MessageType::NeighborStructure => match (extract_u32(buf, 1), extract_u32(buf, 5)) {
                (Some(up), Some(down)) => {
                    let up = checked_payload_len(up)?;
                    let down = checked_payload_len(down)?;
                    NEIGHBOR_STRUCTURE_HEADER_SIZE + up * 10 + down * 2
                }
                _ => return Ok(None),
            },
        };
        Ok(Some(len))
    }

    /// Decode one complete message. `buf` must hold exactly one message.
    pub fn decode(buf: &[u8]) -> CadenceResult<Message> {
        let mut r = WireReader::new(buf);
        let code = r.u8()?;
        let ty = MessageType::from_u8(code).ok_or(CadenceError::UnknownMessageType(code))?;

        let msg = match ty {
            MessageType::Reject => {
                let code = r.u8()?;
                let reject = RejectCode::from_u8(code).ok_or_else(|| {
                    CadenceError::InvalidWireFormat(format!("Unknown reject code {}", code))
                })?;
                Message::Reject(reject)
            }
            MessageType::Ack => Message::Ack,
            MessageType::Resign => Message::Resign,
            MessageType::Failed => Message::Failed,
            MessageType::UdpPort => Message::UdpPort(r.u16()?),
            MessageType::FedIds | MessageType::P2pSendingFedId => {
                let federate = r.federate()?;
                let len = r.u8()? as usize;
                let federation_id = String::from_utf8_lossy(r.bytes(len)?).into_owned();
                if ty == MessageType::FedIds {
                    Message::FedIds {
                        federate,
                        federation_id,
                    }
                } else {
                    Message::P2pSendingFedId {
                        federate,
                        federation_id,
                    }
                }
            }
            MessageType::Timestamp => Message::Timestamp(r.i64()?),
            MessageType::ClockSyncT1 => Message::ClockSyncT1(r.i64()?),
            MessageType::ClockSyncT4 => Message::ClockSyncT4(r.i64()?),
            MessageType::ClockSyncCodedProbe => Message::ClockSyncCodedProbe(r.i64()?),
            MessageType::ClockSyncT3 => Message::ClockSyncT3(r.federate()?),
            MessageType::Message | MessageType::P2pMessage => {
                let port = r.u16()?;
                let federate = r.federate()?;
                let len = checked_payload_len(r.u32()?)?;
                let payload = Bytes::copy_from_slice(r.bytes(len)?);
                let msg = DataMessage {
                    port,
                    federate,
                    payload,
                };
                if ty == MessageType::Message {
                    Message::Data(msg)
                } else {
                    Message::P2pData(msg)
                }
            }
            MessageType::TaggedMessage | MessageType::P2pTaggedMessage => {
                let port = r.u16()?;
                let federate = r.federate()?;
                let len = checked_payload_len(r.u32()?)?;
                let tag = r.tag()?;
                let payload = Bytes::copy_from_slice(r.bytes(len)?);
                let msg = TaggedMessage {
                    port,
                    federate,
                    tag,
                    payload,
                };
                if ty == MessageType::TaggedMessage {
                    Message::Tagged(msg)
                } else {
                    Message::P2pTagged(msg)
                }
            }
            MessageType::NextEventTag => Message::NextEventTag(r.tag()?),
            MessageType::TagAdvanceGrant => Message::TagAdvanceGrant(r.tag()?),
            MessageType::ProvisionalTagAdvanceGrant => {
                Message::ProvisionalTagAdvanceGrant(r.tag()?)
            }
            MessageType::LatestTagComplete => Message::LatestTagComplete(r.tag()?),
            MessageType::StopRequest => Message::StopRequest(r.tag()?),
            MessageType::StopRequestReply => Message::StopRequestReply(r.tag()?),
            MessageType::StopGranted => Message::StopGranted(r.tag()?),
            MessageType::AddressQuery => Message::AddressQuery(r.federate()?),
            MessageType::AddressQueryReply => {
                let port = r.i32()?;
                let octets = r.bytes(4)?;
                let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
                Message::AddressQueryReply { port, addr }
            }
            MessageType::AddressAdvertisement => Message::AddressAdvertisement(r.i32()?),
            MessageType::PortAbsent => {
                let port = r.u16()?;
                let federate = r.federate()?;
                let tag = r.tag()?;
                Message::PortAbsent {
                    port,
                    federate,
                    tag,
                }
            }
            MessageType::NeighborStructure => {
                let n_up = checked_payload_len(r.u32()?)?;
                let n_down = checked_payload_len(r.u32()?)?;
                let mut ns = NeighborStructure::default();
                for _ in 0..n_up {
                    let id = r.federate()?;
                    let delay = r.i64()?;
                    ns.upstream.push((id, delay));
                }
                for _ in 0..n_down {
                    ns.downstream.push(r.federate()?);
                }
                Message::NeighborStructure(ns)
            }
        };

        if r.remaining() != 0 {
            return Err(CadenceError::InvalidWireFormat(format!(
                "{} has {} trailing bytes",
                ty,
                r.remaining()
            )));
        }
        Ok(msg)
    }

    /// Decode one message from the front of a stream buffer, consuming it.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole message.
    pub fn try_decode(buf: &mut BytesMut) -> CadenceResult<Option<Message>> {
        let Some(len) = Message::frame_len(&buf[..])? else {
            return Ok(None);
        };
        if buf.len() < len {
            return Ok(None);
        }
        let frame = buf.split_to(len);
        Message::decode(&frame).map(Some)
    }
}

fn checked_payload_len(len: u32) -> CadenceResult<usize> {
    let len = len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(CadenceError::InvalidWireFormat(format!(
            "Payload length {} exceeds limit",
            len
        )));
    }
    Ok(len)
}

/// Incremental decoder for a byte stream carrying back-to-back messages
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer to read into directly
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Next complete message, if any
    pub fn next_message(&mut self) -> CadenceResult<Option<Message>> {
        Message::try_decode(&mut self.buf)
    }

    /// Bytes buffered but not yet decoded
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Federate id at the front of a buffered FED_IDS, without consuming
    pub fn peek_federate(&self) -> Option<FederateId> {
        match self.buf.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::FedIds) => extract_u16(&self.buf, 1).map(FederateId::new),
            _ => None,
        }
    }
}
