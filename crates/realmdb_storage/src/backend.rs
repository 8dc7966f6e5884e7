//! The backend trait.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// # Invariants
///
/// - `append` returns the offset the bytes were written at
/// - `read_at` returns exactly the bytes written at that offset
/// - after `sync` returns, everything appended so far survives a crash
/// - `replace_all` is atomic: readers observe either the old or the new
///   contents, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] when the range is out
    /// of bounds, or with an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Current size in bytes; the offset of the next append.
    ///
    /// File backends re-read the size from the file so appends made by other
    /// processes become visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes data and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops everything after `new_size`.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole contents with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement could not be made durable; the
    /// previous contents are then left untouched.
    fn replace_all(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the entire contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
