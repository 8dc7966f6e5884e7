//! File damage helpers for recovery tests.
//!
//! A crash can leave a partially written record at the end of the log.
//! These helpers reproduce that on a closed realm file so tests can check
//! that reopening keeps every complete commit.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Cuts `bytes` off the end of the file, as if the last write was torn.
///
/// # Errors
///
/// Fails when the file cannot be opened or resized.
pub fn tear_tail(path: &Path, bytes: u64) -> io::Result<u64> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    let new_len = len.saturating_sub(bytes);
    file.set_len(new_len)?;
    file.sync_all()?;
    Ok(new_len)
}

/// Appends bytes that do not form a valid record.
///
/// # Errors
///
/// Fails when the file cannot be opened or written.
pub fn append_garbage(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Flips one bit at `offset`.
///
/// # Errors
///
/// Fails when the file cannot be read or written, or `offset` is past the
/// end.
pub fn flip_bit(path: &Path, offset: u64) -> io::Result<()> {
    let mut bytes = std::fs::read(path)?;
    let index = usize::try_from(offset)
        .ok()
        .filter(|i| *i < bytes.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset past the end of the file"))?;
    bytes[index] ^= 0x01;
    std::fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tearing_shrinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert_eq!(tear_tail(&path, 3).unwrap(), 7);
        assert_eq!(tear_tail(&path, 30).unwrap(), 0);
        append_garbage(&path, b"xy").unwrap();
        flip_bit(&path, 0).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"yy");
        assert!(flip_bit(&path, 2).is_err());
    }
}
