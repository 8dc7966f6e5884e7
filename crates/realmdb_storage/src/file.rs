//! File-based backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A backend over a single file.
///
/// `flush` hands data to the OS, `sync` calls `sync_all`. The size is
/// re-read from file metadata on every [`StorageBackend::size`] call so that
/// commits appended by another process are picked up on refresh.
///
/// ```no_run
/// use realmdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("default.realm")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
}

impl FileBackend {
    /// Opens or creates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = Self::open_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Opens or creates the file, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::open(path)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> StorageResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    #[cfg(unix)]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let offset = file.seek(SeekFrom::End(0))?;
        if !data.is_empty() {
            file.write_all(data)?;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.file.read().metadata()?.len())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let size = file.metadata()?.len();
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        Ok(())
    }

    fn replace_all(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp = self.temp_path();
        {
            let mut out = File::create(&temp)?;
            out.write_all(data)?;
            out.sync_all()?;
        }

        let mut file = self.file.write();
        if let Err(err) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        *file = Self::open_file(&self.path)?;
        drop(file);

        self.sync_parent_dir()?;
        tracing::debug!(target: "realm.storage", path = %self.path.display(), bytes = data.len(), "replaced file contents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.realm");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.realm")).unwrap();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.realm")).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.realm");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"persistent").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"persistent");
    }

    #[test]
    fn file_sees_appends_from_second_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.realm");
        let mut writer = FileBackend::open(&path).unwrap();
        let reader = FileBackend::open(&path).unwrap();

        writer.append(b"abc").unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.size().unwrap(), 3);
        assert_eq!(reader.read_at(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn file_truncate() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.realm")).unwrap();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"hello");
        assert!(matches!(
            backend.truncate(50),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }

    #[test]
    fn file_replace_all_swaps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.realm");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"a long commit history").unwrap();

        backend.replace_all(b"compact").unwrap();
        assert_eq!(backend.read_all().unwrap(), b"compact");
        assert!(!dir.path().join("a.realm.tmp").exists());

        backend.append(b"+").unwrap();
        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"compact+");
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("a.realm");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.exists());
    }
}
