//! Mob5G PFCP Codec
//!
//! Encoding and decoding of the N4 (PFCP) messages exchanged between a
//! session management function and a user plane function.
//!
//! # Features
//!
//! - Fixed 8-byte header with explicit sequence number and payload length
//! - TLV information elements, including grouped PDR/FAR/Usage Report IEs
//! - Heartbeat, Association and Session messages
//!
//! # Example
//!
//! ```rust
//! use mob5g_pfcp::message::{HeartbeatRequest, PfcpMessage, build_message, parse_message};
//!
//! let msg = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(1234567890));
//! let buf = build_message(&msg, 1).unwrap();
//!
//! let mut bytes = buf.freeze();
//! let (header, decoded) = parse_message(&mut bytes).unwrap();
//! assert_eq!(header.sequence_number, 1);
//! assert_eq!(decoded, msg);
//! ```

pub mod error;
pub mod header;
pub mod ie;
pub mod message;
pub mod types;


pub use error::{PfcpError, PfcpResult};
pub use header::{PfcpHeader, PfcpMessageType, PFCP_HEADER_LEN};
pub use types::PFCP_UDP_PORT;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{PfcpError, PfcpResult};
    pub use crate::header::{PfcpHeader, PfcpMessageType};
    pub use crate::ie::{IeHeader, IeType, RawIe};
    pub use crate::message::{
        build_message, parse_message, AssociationReleaseRequest, AssociationReleaseResponse,
        AssociationSetupRequest, AssociationSetupResponse, AssociationUpdateRequest,
        AssociationUpdateResponse, HeartbeatRequest, HeartbeatResponse, PfcpMessage,
        SessionDeletionRequest, SessionDeletionResponse, SessionEstablishmentRequest,
        SessionEstablishmentResponse, SessionModificationRequest, SessionModificationResponse,
        SessionReportRequest, SessionReportResponse,
    };
    pub use crate::types::{ApplyAction, Far, NodeId, PfcpCause, Pdr, Qos, UsageReport};
}
