//! Versioned storage core.
//!
//! State lives in immutable [`snapshot::SnapshotData`] values shared through
//! `Arc`. A write transaction clones the newest snapshot, applies
//! [`instruction::Instruction`]s to the clone and appends them to the commit
//! log; committing publishes the clone as the next version. Readers pin the
//! version they started on and never observe later commits.

pub(crate) mod apply;
pub(crate) mod instruction;
pub(crate) mod lock;
pub(crate) mod log;
pub(crate) mod slot;
pub(crate) mod snapshot;
pub(crate) mod store;
pub(crate) mod table;

pub use instruction::{CommitChanges, ErasedObject};
pub use log::{CommitOrigin, LogEntry, LogReport};
pub use store::CommitEvent;
