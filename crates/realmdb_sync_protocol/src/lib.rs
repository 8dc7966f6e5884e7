//! # realmdb sync protocol
//!
//! Wire types exchanged between a sync client and a sync server.
//!
//! This crate provides:
//! - [`Payload`] and [`PrimaryKeyValue`], a realm-independent value model
//! - [`SyncOperation`] and [`Changeset`], object-level replication records
//! - [`ClientMessage`] and [`ServerMessage`] (Bind, Upload, Query, Mark,
//!   Download, Error, ...) with checksummed CBOR framing
//! - [`ProtocolErrorCode`] and [`ServerRequestsAction`]
//! - [`instructions`], which captures realm commits as operations and
//!   applies received operations to a realm
//!
//! The crate performs no I/O.
//!
//! ```rust
//! use realmdb_sync_protocol::{ClientMessage, Payload, PrimaryKeyValue, SyncOperation};
//!
//! let op = SyncOperation::upsert("Task", PrimaryKeyValue::Int(1))
//!     .with_field("title", Payload::String("write docs".into()));
//! let message = ClientMessage::Mark { session: 1, request_ident: 7 };
//! let bytes = message.encode().unwrap();
//! assert_eq!(ClientMessage::decode(&bytes).unwrap(), message);
//! assert_eq!(op.class(), "Task");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codes;
mod error;
pub mod instructions;
mod messages;
mod operation;
mod value;

pub use codes::{CompensatingWrite, ErrorMessage, ProtocolErrorCode, ServerRequestsAction};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BatchState, BindMode, ClientMessage, DownloadCursor, FileIdent, QuerySpec, ServerMessage,
    UploadCursor, PROTOCOL_VERSION,
};
pub use operation::{Changeset, ServerChangeset, SyncOperation};
pub use value::{Fields, Payload, PrimaryKeyValue};
