//! Errors reported to a session's error handler.

use realmdb_sync_protocol::{CompensatingWrite, ErrorMessage, ProtocolErrorCode, ServerRequestsAction};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// `user_info` key holding the path of the realm that must be reset.
pub const ORIGINAL_FILE_PATH_KEY: &str = "ORIGINAL_FILE_PATH";

/// `user_info` key holding where the realm is backed up before deletion.
pub const RECOVERY_FILE_PATH_KEY: &str = "RECOVERY_FILE_PATH";

/// An error a session reports to its error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorInfo {
    /// Numeric protocol code.
    pub code: i32,
    /// Description.
    pub message: String,
    /// Whether the session stopped because of the error.
    pub is_fatal: bool,
    /// Whether the realm must be reset before syncing again.
    pub is_client_reset_requested: bool,
    /// What the server asked the client to do.
    pub server_requests_action: ServerRequestsAction,
    /// Extra details, such as [`ORIGINAL_FILE_PATH_KEY`].
    pub user_info: BTreeMap<String, String>,
    /// Writes the server rejected and undid.
    pub compensating_writes: Vec<CompensatingWrite>,
    /// Wait the server asked for before reconnecting.
    pub resumption_delay: Option<Duration>,
}

impl SyncErrorInfo {
    /// An error with the code's default action.
    pub fn from_code(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self::from(ErrorMessage::new(None, code, message))
    }

    /// An error with an explicit fatality, as raised by the application.
    pub fn new(code: i32, message: impl Into<String>, is_fatal: bool) -> Self {
        let action = ProtocolErrorCode::from_code(code).map_or(
            if is_fatal {
                ServerRequestsAction::ApplicationBug
            } else {
                ServerRequestsAction::Transient
            },
            ProtocolErrorCode::default_action,
        );
        Self {
            code,
            message: message.into(),
            is_fatal,
            is_client_reset_requested: action.is_client_reset(),
            server_requests_action: action,
            user_info: BTreeMap::new(),
            compensating_writes: Vec::new(),
            resumption_delay: None,
        }
    }

    /// The known code, if any.
    pub fn error_code(&self) -> Option<ProtocolErrorCode> {
        ProtocolErrorCode::from_code(self.code)
    }

    /// Whether the code is one this client knows.
    pub fn is_recognized(&self) -> bool {
        self.error_code().is_some()
    }

    /// The path of the realm to reset, for client reset errors.
    pub fn original_file_path(&self) -> Option<&str> {
        self.user_info.get(ORIGINAL_FILE_PATH_KEY).map(String::as_str)
    }

    /// Where the realm is backed up, for client reset errors.
    pub fn recovery_file_path(&self) -> Option<&str> {
        self.user_info.get(RECOVERY_FILE_PATH_KEY).map(String::as_str)
    }

    pub(crate) fn is_warning(&self) -> bool {
        self.server_requests_action == ServerRequestsAction::Warning
    }
}

impl From<ErrorMessage> for SyncErrorInfo {
    fn from(error: ErrorMessage) -> Self {
        let is_fatal = error.is_fatal();
        Self {
            code: error.code,
            is_fatal,
            is_client_reset_requested: error.action.is_client_reset(),
            server_requests_action: error.action,
            user_info: BTreeMap::new(),
            resumption_delay: error.resumption_delay_ms.map(Duration::from_millis),
            compensating_writes: error.compensating_writes,
            message: error.message,
        }
    }
}

impl fmt::Display for SyncErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}", self.message, self.code)?;
        if self.is_fatal {
            f.write_str(", fatal")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_sync_protocol::PrimaryKeyValue;

    #[test]
    fn server_errors_keep_their_action() {
        let info = SyncErrorInfo::from(
            ErrorMessage::new(Some(1), ProtocolErrorCode::CompensatingWrite, "denied").with_compensating_writes(
                vec![CompensatingWrite {
                    reason: "read only".into(),
                    object_name: "Task".into(),
                    primary_key: PrimaryKeyValue::Int(1),
                }],
            ),
        );
        assert!(!info.is_fatal);
        assert!(info.is_warning());
        assert!(!info.is_client_reset_requested);
        assert_eq!(info.compensating_writes.len(), 1);
        assert_eq!(info.error_code(), Some(ProtocolErrorCode::CompensatingWrite));

        let reset = SyncErrorInfo::from_code(ProtocolErrorCode::BadClientFileIdent, "unknown file");
        assert!(reset.is_fatal);
        assert!(reset.is_client_reset_requested);
    }

    #[test]
    fn application_errors() {
        let info = SyncErrorInfo::new(4242, "custom", true);
        assert!(!info.is_recognized());
        assert!(info.is_fatal);
        assert_eq!(info.server_requests_action, ServerRequestsAction::ApplicationBug);
        assert_eq!(info.to_string(), "custom (code 4242, fatal)");

        let soft = SyncErrorInfo::new(4242, "soft", false);
        assert_eq!(soft.server_requests_action, ServerRequestsAction::Transient);
        assert!(soft.original_file_path().is_none());
    }
}
