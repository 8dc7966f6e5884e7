//! # realmdb storage
//!
//! Byte-store backends underneath the realm commit log.
//!
//! Backends are opaque: they append, read and truncate bytes and know nothing
//! about commit records, snapshots or schemas. The core owns every format
//! decision layered on top.
//!
//! - [`InMemoryBackend`] backs in-memory realms and tests
//! - [`FileBackend`] backs on-disk realms
//!
//! ```rust
//! use realmdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"version 1").unwrap();
//! assert_eq!(backend.read_at(offset, 9).unwrap(), b"version 1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
