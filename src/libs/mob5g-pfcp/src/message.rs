//! PFCP Messages
//!
//! N4 message structures and their encoding/decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::{PfcpError, PfcpResult};
use crate::header::{PfcpHeader, PfcpMessageType, PFCP_HEADER_LEN};
use crate::ie::{encode_grouped_ie, encode_u16_ie, encode_u32_ie, encode_u64_ie, encode_u8_ie, IeType, RawIe};
use crate::types::{missing, Far, NodeId, PfcpCause, Pdr, UsageReport};

/// Heartbeat Request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub recovery_time_stamp: u32,
}

impl HeartbeatRequest {
    pub fn new(recovery_time_stamp: u32) -> Self {
        Self { recovery_time_stamp }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u32_ie(buf, IeType::RecoveryTimeStamp, self.recovery_time_stamp);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut recovery_time_stamp = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            if ie.ie_type == IeType::RecoveryTimeStamp as u16 {
                recovery_time_stamp = Some(ie.to_u32()?);
            }
        }

        Ok(Self {
            recovery_time_stamp: recovery_time_stamp.ok_or_else(|| missing("Recovery Time Stamp"))?,
        })
    }
}

/// Heartbeat Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub recovery_time_stamp: u32,
}

impl HeartbeatResponse {
    pub fn new(recovery_time_stamp: u32) -> Self {
        Self { recovery_time_stamp }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u32_ie(buf, IeType::RecoveryTimeStamp, self.recovery_time_stamp);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let HeartbeatRequest { recovery_time_stamp } = HeartbeatRequest::decode(buf)?;
        Ok(Self { recovery_time_stamp })
    }
}

/// Association Setup Request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSetupRequest {
    pub node_id: NodeId,
    pub recovery_time_stamp: u32,
    pub up_function_features: Option<u16>,
}

impl AssociationSetupRequest {
    pub fn new(node_id: NodeId, recovery_time_stamp: u32) -> Self {
        Self {
            node_id,
            recovery_time_stamp,
            up_function_features: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)?;
        encode_u32_ie(buf, IeType::RecoveryTimeStamp, self.recovery_time_stamp);
        if let Some(features) = self.up_function_features {
            encode_u16_ie(buf, IeType::UpFunctionFeatures, features);
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;
        let mut recovery_time_stamp = None;
        let mut up_function_features = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
                t if t == IeType::RecoveryTimeStamp as u16 => {
                    recovery_time_stamp = Some(ie.to_u32()?);
                }
                t if t == IeType::UpFunctionFeatures as u16 => {
                    up_function_features = Some(ie.to_u16()?);
                }
                _ => {} // Skip unknown IEs
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
            recovery_time_stamp: recovery_time_stamp.ok_or_else(|| missing("Recovery Time Stamp"))?,
            up_function_features,
        })
    }
}

/// Association Setup Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSetupResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
    pub recovery_time_stamp: u32,
    pub up_function_features: Option<u16>,
}

impl AssociationSetupResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause, recovery_time_stamp: u32) -> Self {
        Self {
            node_id,
            cause,
            recovery_time_stamp,
            up_function_features: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)?;
        encode_u8_ie(buf, IeType::Cause, self.cause as u8);
        encode_u32_ie(buf, IeType::RecoveryTimeStamp, self.recovery_time_stamp);
        if let Some(features) = self.up_function_features {
            encode_u16_ie(buf, IeType::UpFunctionFeatures, features);
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;
        let mut cause = None;
        let mut recovery_time_stamp = None;
        let mut up_function_features = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
                t if t == IeType::Cause as u16 => cause = Some(PfcpCause::decode_ie(&ie)?),
                t if t == IeType::RecoveryTimeStamp as u16 => {
                    recovery_time_stamp = Some(ie.to_u32()?);
                }
                t if t == IeType::UpFunctionFeatures as u16 => {
                    up_function_features = Some(ie.to_u16()?);
                }
                _ => {}
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
            cause: cause.ok_or_else(|| missing("Cause"))?,
            recovery_time_stamp: recovery_time_stamp.ok_or_else(|| missing("Recovery Time Stamp"))?,
            up_function_features,
        })
    }
}

/// Association Update Request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationUpdateRequest {
    pub node_id: NodeId,
    pub recovery_time_stamp: Option<u32>,
    pub up_function_features: Option<u16>,
}

impl AssociationUpdateRequest {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            recovery_time_stamp: None,
            up_function_features: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)?;
        if let Some(ts) = self.recovery_time_stamp {
            encode_u32_ie(buf, IeType::RecoveryTimeStamp, ts);
        }
        if let Some(features) = self.up_function_features {
            encode_u16_ie(buf, IeType::UpFunctionFeatures, features);
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;
        let mut recovery_time_stamp = None;
        let mut up_function_features = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
                t if t == IeType::RecoveryTimeStamp as u16 => {
                    recovery_time_stamp = Some(ie.to_u32()?);
                }
                t if t == IeType::UpFunctionFeatures as u16 => {
                    up_function_features = Some(ie.to_u16()?);
                }
                _ => {}
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
            recovery_time_stamp,
            up_function_features,
        })
    }
}

/// Association Update Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationUpdateResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
}

impl AssociationUpdateResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause) -> Self {
        Self { node_id, cause }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_node_and_cause(buf, &self.node_id, self.cause)
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let (node_id, cause) = decode_node_and_cause(buf)?;
        Ok(Self { node_id, cause })
    }
}

/// Association Release Request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationReleaseRequest {
    pub node_id: NodeId,
}

impl AssociationReleaseRequest {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            if ie.ie_type == IeType::NodeId as u16 {
                node_id = Some(NodeId::decode_ie(&ie)?);
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
        })
    }
}

/// Association Release Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationReleaseResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
}

impl AssociationReleaseResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause) -> Self {
        Self { node_id, cause }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_node_and_cause(buf, &self.node_id, self.cause)
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let (node_id, cause) = decode_node_and_cause(buf)?;
        Ok(Self { node_id, cause })
    }
}

fn encode_node_and_cause(buf: &mut BytesMut, node_id: &NodeId, cause: PfcpCause) -> PfcpResult<()> {
    node_id.encode(buf)?;
    encode_u8_ie(buf, IeType::Cause, cause as u8);
    Ok(())
}

fn decode_node_and_cause(buf: &mut Bytes) -> PfcpResult<(NodeId, PfcpCause)> {
    let mut node_id = None;
    let mut cause = None;

    while buf.has_remaining() {
        let ie = RawIe::decode(buf)?;
        match ie.ie_type {
            t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
            t if t == IeType::Cause as u16 => cause = Some(PfcpCause::decode_ie(&ie)?),
            _ => {}
        }
    }

    Ok((
        node_id.ok_or_else(|| missing("Node ID"))?,
        cause.ok_or_else(|| missing("Cause"))?,
    ))
}

/// Session Establishment Request message
///
/// Carries the CP-allocated SEID in its F-SEID IE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishmentRequest {
    pub node_id: NodeId,
    pub cp_seid: u64,
    pub create_pdrs: Vec<Pdr>,
    pub create_fars: Vec<Far>,
}

impl SessionEstablishmentRequest {
    pub fn new(node_id: NodeId, cp_seid: u64) -> Self {
        Self {
            node_id,
            cp_seid,
            create_pdrs: Vec::new(),
            create_fars: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)?;
        encode_u64_ie(buf, IeType::FSeid, self.cp_seid);
        for pdr in &self.create_pdrs {
            pdr.encode(buf)?;
        }
        for far in &self.create_fars {
            far.encode(buf)?;
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;
        let mut cp_seid = None;
        let mut create_pdrs = Vec::new();
        let mut create_fars = Vec::new();

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
                t if t == IeType::FSeid as u16 => cp_seid = Some(ie.to_u64()?),
                t if t == IeType::CreatePdr as u16 => {
                    let mut data = ie.data;
                    create_pdrs.push(Pdr::decode(&mut data)?);
                }
                t if t == IeType::CreateFar as u16 => {
                    let mut data = ie.data;
                    create_fars.push(Far::decode(&mut data)?);
                }
                _ => {}
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
            cp_seid: cp_seid.ok_or_else(|| missing("CP F-SEID"))?,
            create_pdrs,
            create_fars,
        })
    }
}

/// Session Establishment Response message
///
/// `up_seid` is present when the user plane accepted the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishmentResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
    pub up_seid: Option<u64>,
}

impl SessionEstablishmentResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause) -> Self {
        Self {
            node_id,
            cause,
            up_seid: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        self.node_id.encode(buf)?;
        encode_u8_ie(buf, IeType::Cause, self.cause as u8);
        if let Some(seid) = self.up_seid {
            encode_u64_ie(buf, IeType::FSeid, seid);
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut node_id = None;
        let mut cause = None;
        let mut up_seid = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::NodeId as u16 => node_id = Some(NodeId::decode_ie(&ie)?),
                t if t == IeType::Cause as u16 => cause = Some(PfcpCause::decode_ie(&ie)?),
                t if t == IeType::FSeid as u16 => up_seid = Some(ie.to_u64()?),
                _ => {}
            }
        }

        Ok(Self {
            node_id: node_id.ok_or_else(|| missing("Node ID"))?,
            cause: cause.ok_or_else(|| missing("Cause"))?,
            up_seid,
        })
    }
}

/// Session Modification Request message
///
/// Create PDR/FAR entries replace rules with the same id; removals are
/// applied first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionModificationRequest {
    pub seid: u64,
    pub create_pdrs: Vec<Pdr>,
    pub create_fars: Vec<Far>,
    pub remove_pdrs: Vec<u32>,
    pub remove_fars: Vec<u32>,
}

impl SessionModificationRequest {
    pub fn new(seid: u64) -> Self {
        Self {
            seid,
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u64_ie(buf, IeType::FSeid, self.seid);
        for pdr_id in &self.remove_pdrs {
            encode_grouped_ie(buf, IeType::RemovePdr, |inner| {
                encode_u32_ie(inner, IeType::PdrId, *pdr_id);
                Ok(())
            })?;
        }
        for far_id in &self.remove_fars {
            encode_grouped_ie(buf, IeType::RemoveFar, |inner| {
                encode_u32_ie(inner, IeType::FarId, *far_id);
                Ok(())
            })?;
        }
        for pdr in &self.create_pdrs {
            pdr.encode(buf)?;
        }
        for far in &self.create_fars {
            far.encode(buf)?;
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut seid = None;
        let mut msg = Self::default();

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::FSeid as u16 => seid = Some(ie.to_u64()?),
                t if t == IeType::CreatePdr as u16 => {
                    let mut data = ie.data;
                    msg.create_pdrs.push(Pdr::decode(&mut data)?);
                }
                t if t == IeType::CreateFar as u16 => {
                    let mut data = ie.data;
                    msg.create_fars.push(Far::decode(&mut data)?);
                }
                t if t == IeType::RemovePdr as u16 => {
                    let mut data = ie.data;
                    msg.remove_pdrs.push(decode_rule_id(&mut data, IeType::PdrId, "Remove PDR/PDR ID")?);
                }
                t if t == IeType::RemoveFar as u16 => {
                    let mut data = ie.data;
                    msg.remove_fars.push(decode_rule_id(&mut data, IeType::FarId, "Remove FAR/FAR ID")?);
                }
                _ => {}
            }
        }

        msg.seid = seid.ok_or_else(|| missing("F-SEID"))?;
        Ok(msg)
    }
}

fn decode_rule_id(buf: &mut Bytes, id_type: IeType, name: &str) -> PfcpResult<u32> {
    let mut id = None;
    while buf.has_remaining() {
        let ie = RawIe::decode(buf)?;
        if ie.ie_type == id_type as u16 {
            id = Some(ie.to_u32()?);
        }
    }
    id.ok_or_else(|| missing(name))
}

/// Session Modification Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionModificationResponse {
    pub cause: PfcpCause,
}

impl SessionModificationResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self { cause }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u8_ie(buf, IeType::Cause, self.cause as u8);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        Ok(Self { cause: decode_cause(buf)? })
    }
}

fn decode_cause(buf: &mut Bytes) -> PfcpResult<PfcpCause> {
    let mut cause = None;
    while buf.has_remaining() {
        let ie = RawIe::decode(buf)?;
        if ie.ie_type == IeType::Cause as u16 {
            cause = Some(PfcpCause::decode_ie(&ie)?);
        }
    }
    cause.ok_or_else(|| missing("Cause"))
}

/// Session Deletion Request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeletionRequest {
    pub seid: u64,
}

impl SessionDeletionRequest {
    pub fn new(seid: u64) -> Self {
        Self { seid }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u64_ie(buf, IeType::FSeid, self.seid);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut seid = None;
        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            if ie.ie_type == IeType::FSeid as u16 {
                seid = Some(ie.to_u64()?);
            }
        }
        Ok(Self {
            seid: seid.ok_or_else(|| missing("F-SEID"))?,
        })
    }
}

/// Session Deletion Response message
///
/// Carries the final usage of the deleted session when the user plane has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeletionResponse {
    pub cause: PfcpCause,
    pub usage_report: Option<UsageReport>,
}

impl SessionDeletionResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self {
            cause,
            usage_report: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u8_ie(buf, IeType::Cause, self.cause as u8);
        if let Some(report) = &self.usage_report {
            report.encode(buf)?;
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut cause = None;
        let mut usage_report = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::Cause as u16 => cause = Some(PfcpCause::decode_ie(&ie)?),
                t if t == IeType::UsageReport as u16 => {
                    let mut data = ie.data;
                    usage_report = Some(UsageReport::decode(&mut data)?);
                }
                _ => {}
            }
        }

        Ok(Self {
            cause: cause.ok_or_else(|| missing("Cause"))?,
            usage_report,
        })
    }
}

/// Session Report Request message (UP to CP usage report)
///
/// `seid` is the CP SEID of the reported session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReportRequest {
    pub seid: u64,
    pub usage_report: UsageReport,
}

impl SessionReportRequest {
    pub fn new(seid: u64, usage_report: UsageReport) -> Self {
        Self { seid, usage_report }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u64_ie(buf, IeType::FSeid, self.seid);
        self.usage_report.encode(buf)
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let mut seid = None;
        let mut usage_report = None;

        while buf.has_remaining() {
            let ie = RawIe::decode(buf)?;
            match ie.ie_type {
                t if t == IeType::FSeid as u16 => seid = Some(ie.to_u64()?),
                t if t == IeType::UsageReport as u16 => {
                    let mut data = ie.data;
                    usage_report = Some(UsageReport::decode(&mut data)?);
                }
                _ => {}
            }
        }

        Ok(Self {
            seid: seid.ok_or_else(|| missing("F-SEID"))?,
            usage_report: usage_report.ok_or_else(|| missing("Usage Report"))?,
        })
    }
}

/// Session Report Response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReportResponse {
    pub cause: PfcpCause,
}

impl SessionReportResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self { cause }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_u8_ie(buf, IeType::Cause, self.cause as u8);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        Ok(Self { cause: decode_cause(buf)? })
    }
}

/// PFCP Message enum containing all message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PfcpMessage {
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    AssociationSetupRequest(AssociationSetupRequest),
    AssociationSetupResponse(AssociationSetupResponse),
    AssociationUpdateRequest(AssociationUpdateRequest),
    AssociationUpdateResponse(AssociationUpdateResponse),
    AssociationReleaseRequest(AssociationReleaseRequest),
    AssociationReleaseResponse(AssociationReleaseResponse),
    SessionEstablishmentRequest(SessionEstablishmentRequest),
    SessionEstablishmentResponse(SessionEstablishmentResponse),
    SessionModificationRequest(SessionModificationRequest),
    SessionModificationResponse(SessionModificationResponse),
    SessionDeletionRequest(SessionDeletionRequest),
    SessionDeletionResponse(SessionDeletionResponse),
    SessionReportRequest(SessionReportRequest),
    SessionReportResponse(SessionReportResponse),
}

impl PfcpMessage {
    /// Get the message type
    pub fn message_type(&self) -> PfcpMessageType {
        match self {
            Self::HeartbeatRequest(_) => PfcpMessageType::HeartbeatRequest,
            Self::HeartbeatResponse(_) => PfcpMessageType::HeartbeatResponse,
            Self::AssociationSetupRequest(_) => PfcpMessageType::AssociationSetupRequest,
            Self::AssociationSetupResponse(_) => PfcpMessageType::AssociationSetupResponse,
            Self::AssociationUpdateRequest(_) => PfcpMessageType::AssociationUpdateRequest,
            Self::AssociationUpdateResponse(_) => PfcpMessageType::AssociationUpdateResponse,
            Self::AssociationReleaseRequest(_) => PfcpMessageType::AssociationReleaseRequest,
            Self::AssociationReleaseResponse(_) => PfcpMessageType::AssociationReleaseResponse,
            Self::SessionEstablishmentRequest(_) => PfcpMessageType::SessionEstablishmentRequest,
            Self::SessionEstablishmentResponse(_) => PfcpMessageType::SessionEstablishmentResponse,
            Self::SessionModificationRequest(_) => PfcpMessageType::SessionModificationRequest,
            Self::SessionModificationResponse(_) => PfcpMessageType::SessionModificationResponse,
            Self::SessionDeletionRequest(_) => PfcpMessageType::SessionDeletionRequest,
            Self::SessionDeletionResponse(_) => PfcpMessageType::SessionDeletionResponse,
            Self::SessionReportRequest(_) => PfcpMessageType::SessionReportRequest,
            Self::SessionReportResponse(_) => PfcpMessageType::SessionReportResponse,
        }
    }

    /// Cause carried by a response, if any
    pub fn cause(&self) -> Option<PfcpCause> {
        match self {
            Self::AssociationSetupResponse(msg) => Some(msg.cause),
            Self::AssociationUpdateResponse(msg) => Some(msg.cause),
            Self::AssociationReleaseResponse(msg) => Some(msg.cause),
            Self::SessionEstablishmentResponse(msg) => Some(msg.cause),
            Self::SessionModificationResponse(msg) => Some(msg.cause),
            Self::SessionDeletionResponse(msg) => Some(msg.cause),
            Self::SessionReportResponse(msg) => Some(msg.cause),
            _ => None,
        }
    }

    /// Encode the message body (without header)
    pub fn encode_body(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        match self {
            Self::HeartbeatRequest(msg) => msg.encode(buf),
            Self::HeartbeatResponse(msg) => msg.encode(buf),
            Self::AssociationSetupRequest(msg) => msg.encode(buf),
            Self::AssociationSetupResponse(msg) => msg.encode(buf),
            Self::AssociationUpdateRequest(msg) => msg.encode(buf),
            Self::AssociationUpdateResponse(msg) => msg.encode(buf),
            Self::AssociationReleaseRequest(msg) => msg.encode(buf),
            Self::AssociationReleaseResponse(msg) => msg.encode(buf),
            Self::SessionEstablishmentRequest(msg) => msg.encode(buf),
            Self::SessionEstablishmentResponse(msg) => msg.encode(buf),
            Self::SessionModificationRequest(msg) => msg.encode(buf),
            Self::SessionModificationResponse(msg) => msg.encode(buf),
            Self::SessionDeletionRequest(msg) => msg.encode(buf),
            Self::SessionDeletionResponse(msg) => msg.encode(buf),
            Self::SessionReportRequest(msg) => msg.encode(buf),
            Self::SessionReportResponse(msg) => msg.encode(buf),
        }
    }

    /// Decode message body based on message type
    pub fn decode_body(message_type: PfcpMessageType, buf: &mut Bytes) -> PfcpResult<Self> {
        let msg = match message_type {
            PfcpMessageType::HeartbeatRequest => {
                Self::HeartbeatRequest(HeartbeatRequest::decode(buf)?)
            }
            PfcpMessageType::HeartbeatResponse => {
                Self::HeartbeatResponse(HeartbeatResponse::decode(buf)?)
            }
            PfcpMessageType::AssociationSetupRequest => {
                Self::AssociationSetupRequest(AssociationSetupRequest::decode(buf)?)
            }
            PfcpMessageType::AssociationSetupResponse => {
                Self::AssociationSetupResponse(AssociationSetupResponse::decode(buf)?)
            }
            PfcpMessageType::AssociationUpdateRequest => {
                Self::AssociationUpdateRequest(AssociationUpdateRequest::decode(buf)?)
            }
            PfcpMessageType::AssociationUpdateResponse => {
                Self::AssociationUpdateResponse(AssociationUpdateResponse::decode(buf)?)
            }
            PfcpMessageType::AssociationReleaseRequest => {
                Self::AssociationReleaseRequest(AssociationReleaseRequest::decode(buf)?)
            }
            PfcpMessageType::AssociationReleaseResponse => {
                Self::AssociationReleaseResponse(AssociationReleaseResponse::decode(buf)?)
            }
            PfcpMessageType::SessionEstablishmentRequest => {
                Self::SessionEstablishmentRequest(SessionEstablishmentRequest::decode(buf)?)
            }
            PfcpMessageType::SessionEstablishmentResponse => {
                Self::SessionEstablishmentResponse(SessionEstablishmentResponse::decode(buf)?)
            }
            PfcpMessageType::SessionModificationRequest => {
                Self::SessionModificationRequest(SessionModificationRequest::decode(buf)?)
            }
            PfcpMessageType::SessionModificationResponse => {
                Self::SessionModificationResponse(SessionModificationResponse::decode(buf)?)
            }
            PfcpMessageType::SessionDeletionRequest => {
                Self::SessionDeletionRequest(SessionDeletionRequest::decode(buf)?)
            }
            PfcpMessageType::SessionDeletionResponse => {
                Self::SessionDeletionResponse(SessionDeletionResponse::decode(buf)?)
            }
            PfcpMessageType::SessionReportRequest => {
                Self::SessionReportRequest(SessionReportRequest::decode(buf)?)
            }
            PfcpMessageType::SessionReportResponse => {
                Self::SessionReportResponse(SessionReportResponse::decode(buf)?)
            }
        };
        Ok(msg)
    }
}

/// Build a complete PFCP message with header
///
/// The header length is always computed from the encoded body.
pub fn build_message(message: &PfcpMessage, sequence_number: u32) -> PfcpResult<BytesMut> {
    let mut body = BytesMut::new();
    message.encode_body(&mut body)?;

    let mut header = PfcpHeader::new(message.message_type(), sequence_number);
    header.length = u16::try_from(body.len()).map_err(|_| {
        PfcpError::EncodingError(format!("payload of {} bytes exceeds 65535", body.len()))
    })?;

    let mut buf = BytesMut::with_capacity(PFCP_HEADER_LEN + body.len());
    header.encode(&mut buf);
    buf.put_slice(&body);

    Ok(buf)
}

/// Parse a complete PFCP message
///
/// Bytes after the declared payload are left in `buf` untouched.
pub fn parse_message(buf: &mut Bytes) -> PfcpResult<(PfcpHeader, PfcpMessage)> {
    let header = PfcpHeader::decode(buf)?;

    let body_len = header.length as usize;
    if buf.remaining() < body_len {
        return Err(PfcpError::PayloadLengthMismatch {
            declared: body_len,
            available: buf.remaining(),
        });
    }

    let mut body = buf.copy_to_bytes(body_len);
    let message = PfcpMessage::decode_body(header.message_type, &mut body)?;

    Ok((header, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::encode_bytes_ie;
    use crate::types::{ApplyAction, Qos};

    fn sample_establishment() -> SessionEstablishmentRequest {
        let mut req = SessionEstablishmentRequest::new(NodeId::new("smf-1"), 0x1122_3344_5566_7788);
        req.create_pdrs.push(Pdr {
            rule_id: 1,
            match_criteria: "ue-ip 10.45.0.2".to_string(),
            qos: Qos { five_qi: 9, gbr: 1000, mbr: 5000, priority: 1 },
            far_id: 100,
        });
        req.create_fars.push(Far {
            far_id: 100,
            action: ApplyAction::Forward,
            destination: "internet".to_string(),
        });
        req
    }

    #[test]
    fn test_build_parse_heartbeat() {
        let msg = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(1234567890));
        let buf = build_message(&msg, 1).unwrap();
        assert_eq!(buf.len(), PFCP_HEADER_LEN + 8);

        let mut bytes = buf.freeze();
        let (header, decoded) = parse_message(&mut bytes).unwrap();

        assert_eq!(header.message_type, PfcpMessageType::HeartbeatRequest);
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.length, 8);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_session_establishment_roundtrip() {
        let msg = PfcpMessage::SessionEstablishmentRequest(sample_establishment());
        let mut bytes = build_message(&msg, 42).unwrap().freeze();
        let (_, decoded) = parse_message(&mut bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_modification_roundtrip() {
        let mut req = SessionModificationRequest::new(9);
        req.remove_pdrs = vec![1, 2];
        req.remove_fars = vec![100];
        req.create_fars.push(Far {
            far_id: 101,
            action: ApplyAction::Buffer,
            destination: "edge".to_string(),
        });
        let msg = PfcpMessage::SessionModificationRequest(req);
        let mut bytes = build_message(&msg, 3).unwrap().freeze();
        assert_eq!(parse_message(&mut bytes).unwrap().1, msg);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let msg = PfcpMessage::SessionReportResponse(SessionReportResponse::new(PfcpCause::RequestAccepted));
        let mut buf = build_message(&msg, 7).unwrap();
        buf.put_slice(&[0xAB, 0xCD, 0xEF]);

        let mut bytes = buf.freeze();
        let (_, decoded) = parse_message(&mut bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(bytes.as_ref(), &[0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn test_declared_length_exceeds_buffer() {
        let msg = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(5));
        let buf = build_message(&msg, 1).unwrap();
        let mut bytes = buf.freeze().slice(..PFCP_HEADER_LEN + 4);
        assert_eq!(
            parse_message(&mut bytes),
            Err(PfcpError::PayloadLengthMismatch { declared: 8, available: 4 })
        );
    }

    #[test]
    fn test_ie_overrunning_payload_rejected() {
        // Header declares a 6-byte payload holding an IE that claims 4 value bytes
        let mut buf = BytesMut::new();
        let mut header = PfcpHeader::new(PfcpMessageType::HeartbeatRequest, 1);
        header.length = 6;
        header.encode(&mut buf);
        buf.put_slice(&[0x00, 0x60, 0x00, 0x04, 0x00, 0x00]);
        // Extra datagram bytes must not be borrowed to satisfy the IE
        buf.put_slice(&[0x00, 0x00]);

        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_message(&mut bytes),
            Err(PfcpError::BufferTooShort { needed: 4, available: 2 })
        ));
    }

    #[test]
    fn test_partial_ie_header_rejected() {
        let msg = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(5));
        let mut body = BytesMut::new();
        msg.encode_body(&mut body).unwrap();
        body.put_slice(&[0x00, 0x13]);

        let mut buf = BytesMut::new();
        let mut header = PfcpHeader::new(PfcpMessageType::HeartbeatRequest, 1);
        header.length = body.len() as u16;
        header.encode(&mut buf);
        buf.put_slice(&body);

        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_message(&mut bytes),
            Err(PfcpError::BufferTooShort { needed: 4, available: 2 })
        ));
    }

    #[test]
    fn test_unknown_ie_skipped() {
        let mut body = BytesMut::new();
        encode_bytes_ie(&mut body, IeType::SdfFilter, b"ignored").unwrap();
        body.put_slice(&[0x7F, 0x00, 0x00, 0x01, 0xFF]);
        HeartbeatResponse::new(77).encode(&mut body).unwrap();

        let mut bytes = body.freeze();
        assert_eq!(HeartbeatResponse::decode(&mut bytes).unwrap().recovery_time_stamp, 77);
    }

    #[test]
    fn test_missing_mandatory_cause() {
        let mut body = BytesMut::new();
        NodeId::new("upf-1").encode(&mut body).unwrap();
        let mut bytes = body.freeze();
        assert_eq!(
            AssociationReleaseResponse::decode(&mut bytes),
            Err(PfcpError::MissingMandatoryIe("Cause".to_string()))
        );
    }

    #[test]
    fn test_deletion_response_with_usage() {
        let mut rsp = SessionDeletionResponse::new(PfcpCause::RequestAccepted);
        rsp.usage_report = Some(UsageReport::new(4096, 1500));
        let msg = PfcpMessage::SessionDeletionResponse(rsp);
        let mut bytes = build_message(&msg, 11).unwrap().freeze();
        let (_, decoded) = parse_message(&mut bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.cause(), Some(PfcpCause::RequestAccepted));
    }
}
