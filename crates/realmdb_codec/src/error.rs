//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// What went wrong.
        message: String,
    },

    /// Deserialization failed.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// What went wrong.
        message: String,
    },

    /// A payload does not fit the 32-bit length field.
    #[error("payload of {len} bytes exceeds frame limit")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
    },

    /// A frame failed validation.
    #[error("corrupt frame at offset {offset}: {message}")]
    CorruptFrame {
        /// Offset of the frame start.
        offset: u64,
        /// What failed.
        message: String,
    },
}

impl CodecError {
    /// Creates an encoding error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates a corrupt frame error.
    pub fn corrupt_frame(offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptFrame {
            offset,
            message: message.into(),
        }
    }
}
