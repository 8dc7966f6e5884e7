//! Checksummed record envelope.

use crate::crc::compute_crc32;
use crate::error::{CodecError, CodecResult};

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Bytes added around each payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame within the scanned buffer.
    pub offset: u64,
    /// Record kind byte.
    pub kind: u8,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Encodes payloads into frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameWriter {
    magic: [u8; 4],
    version: u16,
}

impl FrameWriter {
    /// Creates a writer for the given magic and format version.
    #[must_use]
    pub const fn new(magic: [u8; 4], version: u16) -> Self {
        Self { magic, version }
    }

    /// Wraps `payload` in an envelope.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::PayloadTooLarge`] above 4 GiB.
    pub fn encode(&self, kind: u8, payload: &[u8]) -> CodecResult<Vec<u8>> {
        let len = u32::try_from(payload.len())
            .map_err(|_| CodecError::PayloadTooLarge { len: payload.len() })?;

        let mut data = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        data.extend_from_slice(&self.magic);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.push(kind);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Result of scanning a buffer of frames.
#[derive(Debug, Default)]
pub struct FrameScan {
    /// Complete, checksummed frames in order.
    pub frames: Vec<Frame>,
    /// Bytes covered by `frames`; anything after is a torn or corrupt tail.
    pub valid_len: u64,
    /// Why the scan stopped early, if it did.
    pub tail_error: Option<CodecError>,
}

/// Decodes frames written by a [`FrameWriter`] with the same magic.
#[derive(Debug, Clone, Copy)]
pub struct FrameReader {
    magic: [u8; 4],
    max_version: u16,
}

impl FrameReader {
    /// Creates a reader accepting format versions up to `max_version`.
    #[must_use]
    pub const fn new(magic: [u8; 4], max_version: u16) -> Self {
        Self { magic, max_version }
    }

    /// Decodes exactly one frame occupying all of `bytes`.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::CorruptFrame`] on any mismatch.
    pub fn decode_one(&self, bytes: &[u8]) -> CodecResult<Frame> {
        let frame = self.decode_at(bytes, 0)?;
        let used = FRAME_OVERHEAD + frame.payload.len();
        if used != bytes.len() {
            return Err(CodecError::corrupt_frame(0, "trailing bytes after frame"));
        }
        Ok(frame)
    }

    /// Decodes consecutive frames until the buffer ends or a frame fails.
    #[must_use]
    pub fn scan(&self, bytes: &[u8]) -> FrameScan {
        let mut scan = FrameScan::default();
        let mut pos = 0usize;
        while pos < bytes.len() {
            match self.decode_at(&bytes[pos..], pos as u64) {
                Ok(frame) => {
                    pos += FRAME_OVERHEAD + frame.payload.len();
                    scan.frames.push(frame);
                }
                Err(err) => {
                    scan.tail_error = Some(err);
                    break;
                }
            }
        }
        scan.valid_len = pos as u64;
        scan
    }

    fn decode_at(&self, bytes: &[u8], offset: u64) -> CodecResult<Frame> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::corrupt_frame(offset, "truncated header"));
        }
        if bytes[0..4] != self.magic {
            return Err(CodecError::corrupt_frame(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version == 0 || version > self.max_version {
            return Err(CodecError::corrupt_frame(
                offset,
                format!("unsupported format version {version}"),
            ));
        }
        let kind = bytes[6];
        let len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
        let end = HEADER_SIZE + len;
        if bytes.len() < end + CRC_SIZE {
            return Err(CodecError::corrupt_frame(offset, "truncated payload"));
        }
        let stored = u32::from_le_bytes([bytes[end], bytes[end + 1], bytes[end + 2], bytes[end + 3]]);
        if stored != compute_crc32(&bytes[..end]) {
            return Err(CodecError::corrupt_frame(offset, "checksum mismatch"));
        }
        Ok(Frame {
            offset,
            kind,
            payload: bytes[HEADER_SIZE..end].to_vec(),
        })
    }
}
