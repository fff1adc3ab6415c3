//! PFCP Types
//!
//! Value types carried in N4 information elements.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{PfcpError, PfcpResult};
use crate::ie::{encode_bytes_ie, encode_u32_ie, encode_u64_ie, encode_u8_ie, IeType, RawIe};

/// PFCP version
pub const PFCP_VERSION: u8 = 1;

/// PFCP UDP port
pub const PFCP_UDP_PORT: u16 = 8805;

/// PFCP Cause values (TS 29.244 Section 8.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PfcpCause {
    #[default]
    RequestAccepted = 1,
    RequestRejected = 64,
    SessionContextNotFound = 65,
    MandatoryIeMissing = 66,
    ConditionalIeMissing = 67,
    InvalidLength = 68,
    MandatoryIeIncorrect = 69,
    NoEstablishedPfcpAssociation = 72,
    RuleCreationModificationFailure = 73,
    PfcpEntityInCongestion = 74,
    NoResourcesAvailable = 75,
    ServiceNotSupported = 76,
    SystemFailure = 77,
}

impl TryFrom<u8> for PfcpCause {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RequestAccepted),
            64 => Ok(Self::RequestRejected),
            65 => Ok(Self::SessionContextNotFound),
            66 => Ok(Self::MandatoryIeMissing),
            67 => Ok(Self::ConditionalIeMissing),
            68 => Ok(Self::InvalidLength),
            69 => Ok(Self::MandatoryIeIncorrect),
            72 => Ok(Self::NoEstablishedPfcpAssociation),
            73 => Ok(Self::RuleCreationModificationFailure),
            74 => Ok(Self::PfcpEntityInCongestion),
            75 => Ok(Self::NoResourcesAvailable),
            76 => Ok(Self::ServiceNotSupported),
            77 => Ok(Self::SystemFailure),
            _ => Err(PfcpError::InvalidCause(value)),
        }
    }
}

impl PfcpCause {
    /// Get the name of the cause
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestAccepted => "Request Accepted",
            Self::RequestRejected => "Request Rejected",
            Self::SessionContextNotFound => "Session Context Not Found",
            Self::MandatoryIeMissing => "Mandatory IE Missing",
            Self::ConditionalIeMissing => "Conditional IE Missing",
            Self::InvalidLength => "Invalid Length",
            Self::MandatoryIeIncorrect => "Mandatory IE Incorrect",
            Self::NoEstablishedPfcpAssociation => "No Established PFCP Association",
            Self::RuleCreationModificationFailure => "Rule Creation/Modification Failure",
            Self::PfcpEntityInCongestion => "PFCP Entity in Congestion",
            Self::NoResourcesAvailable => "No Resources Available",
            Self::ServiceNotSupported => "Service Not Supported",
            Self::SystemFailure => "System Failure",
        }
    }

    /// Check if cause indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::RequestAccepted)
    }

    pub(crate) fn decode_ie(ie: &RawIe) -> PfcpResult<Self> {
        Self::try_from(ie.to_u8()?)
    }
}

impl fmt::Display for PfcpCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u8)
    }
}

/// Node ID: opaque peer identifier, carried as UTF-8
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_bytes_ie(buf, IeType::NodeId, self.0.as_bytes())
    }

    pub(crate) fn decode_ie(ie: &RawIe) -> PfcpResult<Self> {
        ie.to_string_value().map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Apply Action values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ApplyAction {
    Drop = 0x01,
    Forward = 0x02,
    Buffer = 0x04,
    Notify = 0x08,
    Duplicate = 0x10,
}

impl TryFrom<u8> for ApplyAction {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Drop),
            0x02 => Ok(Self::Forward),
            0x04 => Ok(Self::Buffer),
            0x08 => Ok(Self::Notify),
            0x10 => Ok(Self::Duplicate),
            _ => Err(PfcpError::InvalidApplyAction(value)),
        }
    }
}

/// QoS attached to a PDR
///
/// Value layout: 5QI (1), GBR (4), MBR (4), priority (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qos {
    pub five_qi: u8,
    pub gbr: u32,
    pub mbr: u32,
    pub priority: u8,
}

impl Qos {
    pub const LEN: usize = 10;

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        let mut value = BytesMut::with_capacity(Self::LEN);
        value.put_u8(self.five_qi);
        value.put_u32(self.gbr);
        value.put_u32(self.mbr);
        value.put_u8(self.priority);
        encode_bytes_ie(buf, IeType::Qos, &value)
    }

    pub(crate) fn decode_ie(ie: &RawIe) -> PfcpResult<Self> {
        if ie.data.len() != Self::LEN {
            return Err(PfcpError::InvalidIeLength {
                ie_type: ie.ie_type,
                expected: Self::LEN,
                actual: ie.data.len(),
            });
        }
        let mut data = ie.data.clone();
        Ok(Self {
            five_qi: data.get_u8(),
            gbr: data.get_u32(),
            mbr: data.get_u32(),
            priority: data.get_u8(),
        })
    }
}

/// Packet Detection Rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pdr {
    pub rule_id: u32,
    pub match_criteria: String,
    #[serde(default)]
    pub qos: Qos,
    pub far_id: u32,
}

impl Pdr {
    /// Encode as a Create PDR grouped IE
    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        crate::ie::encode_grouped_ie(buf, IeType::CreatePdr, |inner| {
            encode_u32_ie(inner, IeType::PdrId, self.rule_id);
            encode_bytes_ie(inner, IeType::SdfFilter, self.match_criteria.as_bytes())?;
            self.qos.encode(inner)?;
            encode_u32_ie(inner, IeType::FarId, self.far_id);
            Ok(())
        })
    }

    /// Decode the value of a Create PDR grouped IE
    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut rule_id = None;
        let mut match_criteria = None;
        let mut qos = None;
        let mut far_id = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::PdrId as u16 => rule_id = Some(ie.to_u32()?),
                t if t == IeType::SdfFilter as u16 => match_criteria = Some(ie.to_string_value()?),
                t if t == IeType::Qos as u16 => qos = Some(Qos::decode_ie(&ie)?),
                t if t == IeType::FarId as u16 => far_id = Some(ie.to_u32()?),
                _ => {} // Skip unknown IEs
            }
        }

        Ok(Self {
            rule_id: rule_id.ok_or_else(|| missing("Create PDR/PDR ID"))?,
            match_criteria: match_criteria.ok_or_else(|| missing("Create PDR/SDF Filter"))?,
            qos: qos.ok_or_else(|| missing("Create PDR/QoS"))?,
            far_id: far_id.ok_or_else(|| missing("Create PDR/FAR ID"))?,
        })
    }
}

/// Forwarding Action Rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Far {
    pub far_id: u32,
    pub action: ApplyAction,
    pub destination: String,
}

impl Far {
    /// Encode as a Create FAR grouped IE
    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        crate::ie::encode_grouped_ie(buf, IeType::CreateFar, |inner| {
            encode_u32_ie(inner, IeType::FarId, self.far_id);
            encode_u8_ie(inner, IeType::ApplyAction, self.action as u8);
            encode_bytes_ie(inner, IeType::NetworkInstance, self.destination.as_bytes())
        })
    }

    /// Decode the value of a Create FAR grouped IE
    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut far_id = None;
        let mut action = None;
        let mut destination = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::FarId as u16 => far_id = Some(ie.to_u32()?),
                t if t == IeType::ApplyAction as u16 => {
                    action = Some(ApplyAction::try_from(ie.to_u8()?)?)
                }
                t if t == IeType::NetworkInstance as u16 => {
                    destination = Some(ie.to_string_value()?)
                }
                _ => {}
            }
        }

        Ok(Self {
            far_id: far_id.ok_or_else(|| missing("Create FAR/FAR ID"))?,
            action: action.ok_or_else(|| missing("Create FAR/Apply Action"))?,
            destination: destination.ok_or_else(|| missing("Create FAR/Network Instance"))?,
        })
    }
}

/// Usage counters reported by the user plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageReport {
    /// Total volume in bytes
    pub volume: u64,
    /// Measurement duration in milliseconds
    pub duration_ms: u64,
}

impl UsageReport {
    pub fn new(volume: u64, duration_ms: u64) -> Self {
        Self { volume, duration_ms }
    }

    /// Encode as a Usage Report grouped IE
    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        crate::ie::encode_grouped_ie(buf, IeType::UsageReport, |inner| {
            encode_u64_ie(inner, IeType::VolumeMeasurement, self.volume);
            encode_u64_ie(inner, IeType::DurationMeasurement, self.duration_ms);
            Ok(())
        })
    }

    /// Decode the value of a Usage Report grouped IE
    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut volume = None;
        let mut duration_ms = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::VolumeMeasurement as u16 => volume = Some(ie.to_u64()?),
                t if t == IeType::DurationMeasurement as u16 => duration_ms = Some(ie.to_u64()?),
                _ => {}
            }
        }

        Ok(Self {
            volume: volume.ok_or_else(|| missing("Usage Report/Volume Measurement"))?,
            duration_ms: duration_ms.ok_or_else(|| missing("Usage Report/Duration Measurement"))?,
        })
    }
}

pub(crate) fn missing(name: &str) -> PfcpError {
    PfcpError::MissingMandatoryIe(name.to_string())
}
