//! # realmdb codec
//!
//! Serialization for everything realmdb writes to disk or to the wire.
//!
//! - [`to_cbor`] / [`from_cbor`] encode any `serde` type as CBOR
//! - [`FrameWriter`] / [`FrameReader`] wrap payloads in a checksummed envelope
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! The CRC covers every byte before it. A reader stops at the first torn or
//! corrupt frame and reports how many bytes were valid, so a log can be
//! truncated back to its last complete record after a crash.
//!
//! ```
//! use realmdb_codec::{from_cbor, to_cbor, FrameReader, FrameWriter};
//!
//! let writer = FrameWriter::new(*b"DEMO", 1);
//! let frame = writer.encode(7, &to_cbor(&("commit", 3u64)).unwrap()).unwrap();
//!
//! let reader = FrameReader::new(*b"DEMO", 1);
//! let scan = reader.scan(&frame);
//! let (name, version): (String, u64) = from_cbor(&scan.frames[0].payload).unwrap();
//! assert_eq!((name.as_str(), version), ("commit", 3));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod crc;
mod error;
mod frame;

pub use cbor::{from_cbor, to_cbor};
pub use crc::compute_crc32;
pub use error::{CodecError, CodecResult};
pub use frame::{Frame, FrameReader, FrameScan, FrameWriter, FRAME_OVERHEAD};
