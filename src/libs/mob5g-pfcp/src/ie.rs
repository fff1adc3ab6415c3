//! PFCP Information Elements
//!
//! TLV framing for the closed set of IEs carried on N4. Type codes follow
//! 3GPP TS 29.244 Section 8.1; value layouts are fixed by this crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::{PfcpError, PfcpResult};

/// PFCP IE Type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IeType {
    CreatePdr = 1,
    CreateFar = 3,
    Qos = 7,
    RemovePdr = 15,
    RemoveFar = 16,
    Cause = 19,
    NetworkInstance = 22,
    SdfFilter = 23,
    UpFunctionFeatures = 43,
    ApplyAction = 44,
    PdrId = 56,
    FSeid = 57,
    NodeId = 60,
    VolumeMeasurement = 66,
    DurationMeasurement = 67,
    UsageReport = 80,
    RecoveryTimeStamp = 96,
    FarId = 108,
}

impl IeType {
    /// Get the name of the IE type
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatePdr => "Create PDR",
            Self::CreateFar => "Create FAR",
            Self::Qos => "QoS",
            Self::RemovePdr => "Remove PDR",
            Self::RemoveFar => "Remove FAR",
            Self::Cause => "Cause",
            Self::NetworkInstance => "Network Instance",
            Self::SdfFilter => "SDF Filter",
            Self::UpFunctionFeatures => "UP Function Features",
            Self::ApplyAction => "Apply Action",
            Self::PdrId => "PDR ID",
            Self::FSeid => "F-SEID",
            Self::NodeId => "Node ID",
            Self::VolumeMeasurement => "Volume Measurement",
            Self::DurationMeasurement => "Duration Measurement",
            Self::UsageReport => "Usage Report",
            Self::RecoveryTimeStamp => "Recovery Time Stamp",
            Self::FarId => "FAR ID",
        }
    }
}

/// IE header: 2-byte type, 2-byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IeHeader {
    pub ie_type: u16,
    pub length: u16,
}

impl IeHeader {
    pub const LEN: usize = 4;

    pub fn new(ie_type: u16, length: u16) -> Self {
        Self { ie_type, length }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ie_type);
        buf.put_u16(self.length);
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        if buf.remaining() < Self::LEN {
            return Err(PfcpError::BufferTooShort {
                needed: Self::LEN,
                available: buf.remaining(),
            });
        }
        Ok(Self {
            ie_type: buf.get_u16(),
            length: buf.get_u16(),
        })
    }
}

/// An undecoded IE: its type and the raw value bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIe {
    pub ie_type: u16,
    pub data: Bytes,
}

impl RawIe {
    pub fn new(ie_type: u16, data: Bytes) -> Self {
        Self { ie_type, data }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> PfcpResult<()> {
        encode_bytes_ie_raw(buf, self.ie_type, &self.data)
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let header = IeHeader::decode(buf)?;
        if buf.remaining() < header.length as usize {
            return Err(PfcpError::BufferTooShort {
                needed: header.length as usize,
                available: buf.remaining(),
            });
        }
        let data = buf.copy_to_bytes(header.length as usize);
        Ok(Self {
            ie_type: header.ie_type,
            data,
        })
    }

    fn expect_len(&self, expected: usize) -> PfcpResult<()> {
        if self.data.len() != expected {
            return Err(PfcpError::InvalidIeLength {
                ie_type: self.ie_type,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn to_u8(&self) -> PfcpResult<u8> {
        self.expect_len(1)?;
        Ok(self.data[0])
    }

    pub fn to_u16(&self) -> PfcpResult<u16> {
        self.expect_len(2)?;
        Ok(self.data.clone().get_u16())
    }

    pub fn to_u32(&self) -> PfcpResult<u32> {
        self.expect_len(4)?;
        Ok(self.data.clone().get_u32())
    }

    pub fn to_u64(&self) -> PfcpResult<u64> {
        self.expect_len(8)?;
        Ok(self.data.clone().get_u64())
    }

    pub fn to_string_value(&self) -> PfcpResult<String> {
        std::str::from_utf8(&self.data)
            .map(str::to_owned)
            .map_err(|_| PfcpError::InvalidUtf8(self.ie_type))
    }
}

/// Helper to encode a u8 IE
pub fn encode_u8_ie(buf: &mut BytesMut, ie_type: IeType, value: u8) {
    let header = IeHeader::new(ie_type as u16, 1);
    header.encode(buf);
    buf.put_u8(value);
}

/// Helper to encode a u16 IE
pub fn encode_u16_ie(buf: &mut BytesMut, ie_type: IeType, value: u16) {
    let header = IeHeader::new(ie_type as u16, 2);
    header.encode(buf);
    buf.put_u16(value);
}

/// Helper to encode a u32 IE
pub fn encode_u32_ie(buf: &mut BytesMut, ie_type: IeType, value: u32) {
    let header = IeHeader::new(ie_type as u16, 4);
    header.encode(buf);
    buf.put_u32(value);
}

/// Helper to encode a u64 IE
pub fn encode_u64_ie(buf: &mut BytesMut, ie_type: IeType, value: u64) {
    let header = IeHeader::new(ie_type as u16, 8);
    header.encode(buf);
    buf.put_u64(value);
}

/// Helper to encode bytes IE
pub fn encode_bytes_ie(buf: &mut BytesMut, ie_type: IeType, data: &[u8]) -> PfcpResult<()> {
    encode_bytes_ie_raw(buf, ie_type as u16, data)
}

fn encode_bytes_ie_raw(buf: &mut BytesMut, ie_type: u16, data: &[u8]) -> PfcpResult<()> {
    let length = u16::try_from(data.len()).map_err(|_| {
        PfcpError::EncodingError(format!("IE {} value of {} bytes exceeds 65535", ie_type, data.len()))
    })?;
    IeHeader::new(ie_type, length).encode(buf);
    buf.put_slice(data);
    Ok(())
}

/// Encode a grouped IE; the length is computed from what `body` writes
pub fn encode_grouped_ie<F>(buf: &mut BytesMut, ie_type: IeType, body: F) -> PfcpResult<()>
where
    F: FnOnce(&mut BytesMut) -> PfcpResult<()>,
{
    let mut inner = BytesMut::new();
    body(&mut inner)?;
    encode_bytes_ie(buf, ie_type, &inner)
}
