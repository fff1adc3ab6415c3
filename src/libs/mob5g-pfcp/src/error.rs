//! PFCP Error Types
//!
//! Error types for PFCP codec operations.

use thiserror::Error;

/// PFCP Error type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PfcpError {
    /// Buffer too short for operation
    #[error("Buffer too short: needed {needed} bytes, available {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Header declares more payload than the datagram carries
    #[error("Payload length mismatch: declared {declared} bytes, available {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// Invalid message type
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid cause value
    #[error("Invalid cause value: {0}")]
    InvalidCause(u8),

    /// Invalid apply action value
    #[error("Invalid apply action: {0}")]
    InvalidApplyAction(u8),

    /// Fixed-width IE carrying the wrong number of bytes
    #[error("Invalid length for IE {ie_type}: expected {expected}, got {actual}")]
    InvalidIeLength {
        ie_type: u16,
        expected: usize,
        actual: usize,
    },

    /// String IE that is not valid UTF-8
    #[error("IE {0} is not valid UTF-8")]
    InvalidUtf8(u16),

    /// Encoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Missing mandatory IE
    #[error("Missing mandatory IE: {0}")]
    MissingMandatoryIe(String),

    /// Version not supported
    #[error("PFCP version not supported: {0}")]
    VersionNotSupported(u8),
}

/// PFCP Result type
pub type PfcpResult<T> = Result<T, PfcpError>;
