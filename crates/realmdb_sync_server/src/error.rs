//! Error types for the sync server.

use realmdb_core::CoreError;
use realmdb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A server realm could not be read or written.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// The server directory could not be prepared.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The access token is malformed or forged.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The access token is older than the configured expiry.
    #[error("access token expired")]
    TokenExpired,

    /// The server was switched offline.
    #[error("server unavailable")]
    Unavailable,

    /// The server thread has stopped.
    #[error("server stopped")]
    Stopped,

    /// The connection id is not open.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),
}

impl ServerError {
    /// Whether a client may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::TokenExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ServerError::Unavailable.is_retryable());
        assert!(ServerError::TokenExpired.is_retryable());
        assert!(!ServerError::NotAuthorized("forged".into()).is_retryable());
        assert!(!ServerError::Stopped.is_retryable());
        assert_eq!(ServerError::UnknownConnection(4).to_string(), "unknown connection 4");
    }
}
