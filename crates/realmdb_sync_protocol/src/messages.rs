//! Protocol messages.
//!
//! Every message travels as one frame: CBOR payload, message type code as
//! the frame kind, CRC over the whole frame.

use crate::codes::ErrorMessage;
use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{Changeset, ServerChangeset};
use realmdb_codec::{from_cbor, to_cbor, FrameReader, FrameWriter};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

const CLIENT_MAGIC: [u8; 4] = *b"RSCL";
const SERVER_MAGIC: [u8; 4] = *b"RSSV";

/// Identity the server assigned to a client file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileIdent {
    /// Identifier, unique per server realm.
    pub ident: u64,
    /// Random salt guarding against reuse after a server reset.
    pub salt: i64,
}

/// How far a client has downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadCursor {
    /// Newest server version integrated by the client.
    pub server_version: u64,
    /// Newest client version the server had integrated at that point.
    pub last_integrated_client_version: u64,
}

/// How far a client has uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Newest client version included in this or an earlier upload.
    pub client_version: u64,
    /// Newest server version integrated locally.
    pub last_integrated_server_version: u64,
}

/// Which server data a session binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMode {
    /// Partition based sync with a partition value.
    Partition(String),
    /// Flexible (query based) sync.
    Flexible,
}

/// One subscription as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Class the query runs against.
    pub class: String,
    /// Query text.
    pub query: String,
}

/// Position of a download message in a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchState {
    /// Regular changes.
    #[default]
    SteadyState,
    /// Bootstrap data with more messages to come.
    MoreToCome,
    /// Final bootstrap message.
    LastInBatch,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Opens a session on a server realm.
    Bind {
        /// Client-chosen session number.
        session: u64,
        /// Path the client keeps the realm at, for diagnostics.
        path: String,
        /// Partition or flexible.
        mode: BindMode,
        /// Access token.
        access_token: String,
        /// Identity from an earlier bind; `None` asks for a new one.
        file_ident: Option<FileIdent>,
        /// Download progress so far.
        download: DownloadCursor,
        /// Active query set for flexible sync: version and queries.
        query: Option<(u64, Vec<QuerySpec>)>,
        /// Protocol version.
        protocol_version: u16,
    },
    /// Local changes.
    Upload {
        /// Session number.
        session: u64,
        /// Progress covered by this upload.
        progress: UploadCursor,
        /// Changesets in client version order.
        changesets: Vec<Changeset>,
    },
    /// Replaces the session's query set (flexible sync).
    Query {
        /// Session number.
        session: u64,
        /// Version of the subscription set.
        query_version: u64,
        /// Queries.
        queries: Vec<QuerySpec>,
    },
    /// Asks the server to echo `request_ident` once everything before it
    /// was sent.
    Mark {
        /// Session number.
        session: u64,
        /// Echoed identifier.
        request_ident: u64,
    },
    /// Keepalive.
    Ping {
        /// Client clock, in milliseconds.
        timestamp: i64,
    },
    /// Closes a session.
    Unbind {
        /// Session number.
        session: u64,
    },
}

impl ClientMessage {
    /// Message type code; also the frame kind.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Bind { .. } => 1,
            Self::Upload { .. } => 2,
            Self::Query { .. } => 3,
            Self::Mark { .. } => 4,
            Self::Ping { .. } => 5,
            Self::Unbind { .. } => 6,
        }
    }

    /// Session the message belongs to, if any.
    pub fn session(&self) -> Option<u64> {
        match self {
            Self::Bind { session, .. }
            | Self::Upload { session, .. }
            | Self::Query { session, .. }
            | Self::Mark { session, .. }
            | Self::Unbind { session } => Some(*session),
            Self::Ping { .. } => None,
        }
    }

    /// Encodes as one frame.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode(CLIENT_MAGIC, self.type_code(), self)
    }

    /// Decodes one frame.
    ///
    /// # Errors
    ///
    /// Fails on corrupt frames and when the frame kind disagrees with the
    /// payload.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (kind, message): (u8, Self) = decode(CLIENT_MAGIC, bytes)?;
        check_kind(kind, message.type_code())?;
        Ok(message)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Identity for a newly bound client file.
    Ident {
        /// Session number.
        session: u64,
        /// Assigned identity.
        file_ident: FileIdent,
    },
    /// Changes from the server.
    Download {
        /// Session number.
        session: u64,
        /// Progress after integrating this message.
        progress: DownloadCursor,
        /// Bytes the server still has to send after this message.
        downloadable_bytes: u64,
        /// Query version the data belongs to (flexible sync).
        query_version: u64,
        /// Bootstrap position.
        batch_state: BatchState,
        /// Changesets in server version order.
        changesets: Vec<ServerChangeset>,
    },
    /// Echo of a client mark.
    Mark {
        /// Session number.
        session: u64,
        /// The client's identifier.
        request_ident: u64,
    },
    /// A connection or session error.
    Error(ErrorMessage),
    /// A subscription set was rejected (flexible sync).
    QueryError {
        /// Session number.
        session: u64,
        /// Rejected version.
        query_version: u64,
        /// Why.
        message: String,
    },
    /// Keepalive reply.
    Pong {
        /// The ping's timestamp.
        timestamp: i64,
    },
    /// Confirms an unbind.
    Unbound {
        /// Session number.
        session: u64,
    },
}

impl ServerMessage {
    /// Message type code; also the frame kind.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Ident { .. } => 11,
            Self::Download { .. } => 12,
            Self::Mark { .. } => 13,
            Self::Error(_) => 14,
            Self::QueryError { .. } => 15,
            Self::Pong { .. } => 16,
            Self::Unbound { .. } => 17,
        }
    }

    /// Encodes as one frame.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode(SERVER_MAGIC, self.type_code(), self)
    }

    /// Decodes one frame.
    ///
    /// # Errors
    ///
    /// Fails on corrupt frames and when the frame kind disagrees with the
    /// payload.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (kind, message): (u8, Self) = decode(SERVER_MAGIC, bytes)?;
        check_kind(kind, message.type_code())?;
        Ok(message)
    }
}

fn encode<T: Serialize>(magic: [u8; 4], kind: u8, message: &T) -> ProtocolResult<Vec<u8>> {
    let payload = to_cbor(message)?;
    Ok(FrameWriter::new(magic, PROTOCOL_VERSION).encode(kind, &payload)?)
}

fn decode<T: serde::de::DeserializeOwned>(magic: [u8; 4], bytes: &[u8]) -> ProtocolResult<(u8, T)> {
    let frame = FrameReader::new(magic, PROTOCOL_VERSION).decode_one(bytes)?;
    Ok((frame.kind, from_cbor(&frame.payload)?))
}

fn check_kind(kind: u8, expected: u8) -> ProtocolResult<()> {
    if kind == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnknownMessageType(kind))
    }
}
