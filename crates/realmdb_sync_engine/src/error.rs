//! Error types for the sync engine.

use crate::error_info::SyncErrorInfo;
use realmdb_codec::CodecError;
use realmdb_core::CoreError;
use realmdb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting may help.
        retryable: bool,
    },

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Database error during sync.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// Sync metadata on disk is unreadable.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error on sync metadata or file actions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server or the application reported an error for the session.
    #[error("session error: {0}")]
    Session(SyncErrorInfo),

    /// The user's access token could not be refreshed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A subscription set was rejected.
    #[error("subscription set failed: {0}")]
    SubscriptionFailed(String),

    /// The operation is not possible in the current state.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// A wait was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A wait ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The sync client thread is gone.
    #[error("sync client stopped")]
    ClientStopped,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a wrong-state error.
    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::WrongState(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            SyncError::Session(info) => !info.is_fatal,
            _ => false,
        }
    }
}
