//! Protocol error codes and the actions a server can request.

use crate::value::PrimaryKeyValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the server asks a client to do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerRequestsAction {
    /// Nothing; informational.
    #[default]
    NoAction,
    /// The client broke the protocol.
    ProtocolViolation,
    /// The application is misconfigured.
    ApplicationBug,
    /// Keep syncing; something was rejected.
    Warning,
    /// Reconnect after a delay.
    Transient,
    /// Delete the local file.
    DeleteRealm,
    /// Discard or recover local history and start over.
    ClientReset,
    /// Like [`ServerRequestsAction::ClientReset`], without recovery.
    ClientResetNoRecovery,
    /// Reopen with flexible sync.
    MigrateToFlx,
    /// Reopen with partition based sync.
    RevertToPbs,
}

impl ServerRequestsAction {
    /// Whether the session can continue after this action.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::NoAction | Self::Warning | Self::Transient)
    }

    /// Whether the client must reset its file.
    #[must_use]
    pub fn is_client_reset(self) -> bool {
        matches!(
            self,
            Self::ClientReset | Self::ClientResetNoRecovery | Self::MigrateToFlx | Self::RevertToPbs
        )
    }
}

macro_rules! error_codes {
    ($($name:ident = $code:literal => $action:ident, $text:literal;)*) => {
        /// Errors a sync server reports.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ProtocolErrorCode {
            $(
                #[doc = $text]
                $name,
            )*
        }

        impl ProtocolErrorCode {
            /// Numeric code on the wire.
            #[must_use]
            pub fn code(self) -> i32 {
                match self {
                    $(Self::$name => $code,)*
                }
            }

            /// Looks a code up.
            #[must_use]
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// The action clients take unless the server says otherwise.
            #[must_use]
            pub fn default_action(self) -> ServerRequestsAction {
                match self {
                    $(Self::$name => ServerRequestsAction::$action,)*
                }
            }

            /// Human readable description.
            #[must_use]
            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $text,)*
                }
            }
        }
    };
}

error_codes! {
    ConnectionClosed = 100 => Transient, "Connection closed (no error)";
    OtherError = 101 => Transient, "Other connection level error";
    UnknownMessage = 102 => ProtocolViolation, "Unknown type of input message";
    BadSyntax = 103 => ProtocolViolation, "Bad syntax in input message head";
    LimitsExceeded = 104 => ApplicationBug, "Limits exceeded in input message";
    WrongProtocolVersion = 105 => ProtocolViolation, "Wrong protocol version";
    BadSessionIdent = 106 => ProtocolViolation, "Bad session identifier in input message";
    ReuseOfSessionIdent = 107 => ProtocolViolation, "Overlapping reuse of session identifier";
    BoundInOtherSession = 108 => ProtocolViolation, "Client file bound in other session";
    BadMessageOrder = 109 => ProtocolViolation, "Bad input message order";
    SessionClosed = 200 => Transient, "Session closed (no error)";
    OtherSessionError = 201 => Transient, "Other session level error";
    TokenExpired = 202 => Transient, "Access token expired";
    BadAuthentication = 203 => ApplicationBug, "Bad user authentication";
    IllegalRealmPath = 204 => ApplicationBug, "Illegal realm path";
    NoSuchRealm = 205 => ApplicationBug, "No such realm";
    PermissionDenied = 206 => ApplicationBug, "Permission denied";
    BadServerFileIdent = 207 => ClientReset, "Bad server file identifier";
    BadClientFileIdent = 208 => ClientReset, "Bad client file identifier";
    BadServerVersion = 209 => ClientReset, "Bad server version";
    BadClientVersion = 210 => ClientReset, "Bad client version";
    DivergingHistories = 211 => ClientReset, "Diverging histories";
    BadChangeset = 212 => ProtocolViolation, "Bad changeset";
    UserMismatch = 216 => ApplicationBug, "User mismatch for client file identifier";
    TooManySessions = 217 => Transient, "Too many sessions in connection";
    BadQuery = 226 => ApplicationBug, "Bad query";
    ObjectAlreadyExists = 227 => Warning, "Object already exists";
    ServerPermissionsChanged = 228 => ClientReset, "Server permissions changed";
    InitialSyncNotCompleted = 229 => Transient, "Initial sync not completed";
    WriteNotAllowed = 230 => Warning, "Write not allowed";
    CompensatingWrite = 231 => Warning, "Compensating write";
    MigrateToFlx = 232 => MigrateToFlx, "Migrate to flexible sync";
    BadProgress = 233 => ProtocolViolation, "Bad progress information";
    RevertToPbs = 234 => RevertToPbs, "Revert to partition based sync";
}

impl ProtocolErrorCode {
    /// Whether the error concerns one session rather than the connection.
    #[must_use]
    pub fn is_session_level(self) -> bool {
        self.code() >= 200
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// A client write the server rejected and undid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensatingWrite {
    /// Why the write was rejected.
    pub reason: String,
    /// Class of the object.
    pub object_name: String,
    /// Primary key of the object.
    pub primary_key: PrimaryKeyValue,
}

/// An error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Session the error concerns; `None` for connection level errors.
    pub session: Option<u64>,
    /// Numeric error code.
    pub code: i32,
    /// Description.
    pub message: String,
    /// Whether reconnecting may succeed.
    pub try_again: bool,
    /// What the client should do.
    pub action: ServerRequestsAction,
    /// Rejected writes, for compensating write errors.
    pub compensating_writes: Vec<CompensatingWrite>,
    /// Server-suggested wait before reconnecting, in milliseconds.
    pub resumption_delay_ms: Option<u64>,
}

impl ErrorMessage {
    /// An error with the code's default action.
    pub fn new(session: Option<u64>, code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        let action = code.default_action();
        Self {
            session,
            code: code.code(),
            message: message.into(),
            try_again: action == ServerRequestsAction::Transient,
            action,
            compensating_writes: Vec::new(),
            resumption_delay_ms: None,
        }
    }

    /// Overrides the requested action.
    #[must_use]
    pub fn with_action(mut self, action: ServerRequestsAction) -> Self {
        self.action = action;
        self.try_again = action == ServerRequestsAction::Transient;
        self
    }

    /// Attaches rejected writes.
    #[must_use]
    pub fn with_compensating_writes(mut self, writes: Vec<CompensatingWrite>) -> Self {
        self.compensating_writes = writes;
        self
    }

    /// The known code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<ProtocolErrorCode> {
        ProtocolErrorCode::from_code(self.code)
    }

    /// Whether the session stops because of this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.action.is_fatal()
    }
}
