//! Error types for the sync protocol.

use realmdb_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Encoding or framing failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A frame carried a message type this version does not know.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A well-formed message broke a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Creates an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}
