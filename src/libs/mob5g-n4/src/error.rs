//! N4 Error Types

use mob5g_pfcp::types::{NodeId, PfcpCause};
use mob5g_pfcp::PfcpError;
use thiserror::Error;

use crate::assoc::AssociationState;
use crate::sess::SessionState;
use crate::store::StoreError;

/// N4 engine error type
#[derive(Debug, Error)]
pub enum N4Error {
    /// Malformed or unencodable PFCP message
    #[error("PFCP codec error: {0}")]
    Codec(#[from] PfcpError),

    /// Socket bind or I/O failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("No established association with {0}")]
    AssociationNotEstablished(NodeId),

    #[error("Association with {0} not found")]
    AssociationNotFound(NodeId),

    #[error("Association with {node_id} is {state:?}")]
    InvalidAssociationState {
        node_id: NodeId,
        state: AssociationState,
    },

    #[error("Session {0:#x} not found")]
    SessionNotFound(u64),

    #[error("Session {seid:#x} is {state:?}")]
    InvalidSessionState { seid: u64, state: SessionState },

    #[error("Invalid rule set: {0}")]
    InvalidRules(String),

    /// Peer answered with a non-success cause
    #[error("Request rejected by peer: {0}")]
    Rejected(PfcpCause),

    /// No response after the retransmission budget, or caller deadline elapsed
    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The correlator was dropped with the request outstanding
    #[error("N4 node shut down")]
    Shutdown,
}

/// N4 Result type
pub type N4Result<T> = Result<T, N4Error>;
