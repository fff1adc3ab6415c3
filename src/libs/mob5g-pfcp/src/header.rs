//! PFCP Header
//!
//! Fixed-width N4 message header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::{PfcpError, PfcpResult};
use crate::types::PFCP_VERSION;

/// PFCP Header length (8 bytes)
pub const PFCP_HEADER_LEN: usize = 8;

/// PFCP Message Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PfcpMessageType {
    // Node related messages
    HeartbeatRequest = 1,
    HeartbeatResponse = 2,
    AssociationSetupRequest = 5,
    AssociationSetupResponse = 6,
    AssociationUpdateRequest = 7,
    AssociationUpdateResponse = 8,
    AssociationReleaseRequest = 9,
    AssociationReleaseResponse = 10,

    // Session related messages
    SessionEstablishmentRequest = 50,
    SessionEstablishmentResponse = 51,
    SessionModificationRequest = 52,
    SessionModificationResponse = 53,
    SessionDeletionRequest = 54,
    SessionDeletionResponse = 55,
    SessionReportRequest = 56,
    SessionReportResponse = 57,
}

impl TryFrom<u8> for PfcpMessageType {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HeartbeatRequest),
            2 => Ok(Self::HeartbeatResponse),
            5 => Ok(Self::AssociationSetupRequest),
            6 => Ok(Self::AssociationSetupResponse),
            7 => Ok(Self::AssociationUpdateRequest),
            8 => Ok(Self::AssociationUpdateResponse),
            9 => Ok(Self::AssociationReleaseRequest),
            10 => Ok(Self::AssociationReleaseResponse),
            50 => Ok(Self::SessionEstablishmentRequest),
            51 => Ok(Self::SessionEstablishmentResponse),
            52 => Ok(Self::SessionModificationRequest),
            53 => Ok(Self::SessionModificationResponse),
            54 => Ok(Self::SessionDeletionRequest),
            55 => Ok(Self::SessionDeletionResponse),
            56 => Ok(Self::SessionReportRequest),
            57 => Ok(Self::SessionReportResponse),
            _ => Err(PfcpError::InvalidMessageType(value)),
        }
    }
}

impl PfcpMessageType {
    /// Check if this message type belongs to a session
    pub fn is_session(&self) -> bool {
        (*self as u8) >= 50
    }

    /// Check if this message type is a request
    pub fn is_request(&self) -> bool {
        self.response_type().is_some()
    }

    /// Check if this message type is a response
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// The response type that answers this request type
    pub fn response_type(&self) -> Option<Self> {
        match self {
            Self::HeartbeatRequest => Some(Self::HeartbeatResponse),
            Self::AssociationSetupRequest => Some(Self::AssociationSetupResponse),
            Self::AssociationUpdateRequest => Some(Self::AssociationUpdateResponse),
            Self::AssociationReleaseRequest => Some(Self::AssociationReleaseResponse),
            Self::SessionEstablishmentRequest => Some(Self::SessionEstablishmentResponse),
            Self::SessionModificationRequest => Some(Self::SessionModificationResponse),
            Self::SessionDeletionRequest => Some(Self::SessionDeletionResponse),
            Self::SessionReportRequest => Some(Self::SessionReportResponse),
            _ => None,
        }
    }

    /// Get the name of the message type
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeartbeatRequest => "Heartbeat Request",
            Self::HeartbeatResponse => "Heartbeat Response",
            Self::AssociationSetupRequest => "Association Setup Request",
            Self::AssociationSetupResponse => "Association Setup Response",
            Self::AssociationUpdateRequest => "Association Update Request",
            Self::AssociationUpdateResponse => "Association Update Response",
            Self::AssociationReleaseRequest => "Association Release Request",
            Self::AssociationReleaseResponse => "Association Release Response",
            Self::SessionEstablishmentRequest => "Session Establishment Request",
            Self::SessionEstablishmentResponse => "Session Establishment Response",
            Self::SessionModificationRequest => "Session Modification Request",
            Self::SessionModificationResponse => "Session Modification Response",
            Self::SessionDeletionRequest => "Session Deletion Request",
            Self::SessionDeletionResponse => "Session Deletion Response",
            Self::SessionReportRequest => "Session Report Request",
            Self::SessionReportResponse => "Session Report Response",
        }
    }
}

/// PFCP Header structure
///
/// ```text
/// +---------+---------+-------------------------------+---------------+
/// | Version |  Type   |        Sequence Number        |    Length     |
/// | 1 byte  | 1 byte  |           4 bytes             |   2 bytes     |
/// +---------+---------+-------------------------------+---------------+
/// ```
///
/// All multi-byte fields are big-endian. `length` counts payload bytes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpHeader {
    /// PFCP version (must be 1)
    pub version: u8,
    /// Message type
    pub message_type: PfcpMessageType,
    /// Sequence number
    pub sequence_number: u32,
    /// Payload length in bytes
    pub length: u16,
}

impl PfcpHeader {
    /// Create a new PFCP header with an empty payload
    pub fn new(message_type: PfcpMessageType, sequence_number: u32) -> Self {
        Self {
            version: PFCP_VERSION,
            message_type,
            sequence_number,
            length: 0,
        }
    }

    /// Encode the header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.message_type as u8);
        buf.put_u32(self.sequence_number);
        buf.put_u16(self.length);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        if buf.remaining() < PFCP_HEADER_LEN {
            return Err(PfcpError::BufferTooShort {
                needed: PFCP_HEADER_LEN,
                available: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != PFCP_VERSION {
            return Err(PfcpError::VersionNotSupported(version));
        }

        let message_type = PfcpMessageType::try_from(buf.get_u8())?;
        let sequence_number = buf.get_u32();
        let length = buf.get_u16();

        Ok(Self {
            version,
            message_type,
            sequence_number,
            length,
        })
    }
}
