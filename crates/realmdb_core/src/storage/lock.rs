//! Writer exclusion within a process and across processes.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_HEADER: &[u8; 8] = b"RLMLOCK1";

/// Single-writer lock shared by every handle on one store.
///
/// Unlike a plain mutex guard, [`WriteLockGuard`] owns an `Arc` to the lock,
/// so an open write transaction can be handed to a background commit thread.
#[derive(Debug, Default)]
pub(crate) struct WriteLock {
    held: Mutex<bool>,
    released: Condvar,
}

#[derive(Debug)]
pub(crate) struct WriteLockGuard {
    lock: Arc<WriteLock>,
}

impl WriteLock {
    pub fn acquire(self: &Arc<Self>) -> WriteLockGuard {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        WriteLockGuard {
            lock: Arc::clone(self),
        }
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        *self.lock.held.lock() = false;
        self.lock.released.notify_one();
    }
}

/// Lock files next to a realm file.
///
/// `<path>.lock` serializes writers across processes. `<path>.note` is held
/// shared by every process with the realm open, and exclusively by one that
/// needs to be the sole user (compaction).
#[derive(Debug)]
pub(crate) struct FileLocks {
    lock_path: PathBuf,
    writer: File,
    session: File,
}

#[derive(Debug)]
pub(crate) struct FileWriteGuard {
    locks: Arc<FileLocks>,
}

impl FileLocks {
    pub fn open(realm_path: &Path) -> CoreResult<Arc<Self>> {
        let lock_path = sibling(realm_path, "lock");
        let mut writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CoreError::from_io(&lock_path, &e))?;
        check_header(&mut writer, &lock_path)?;

        let note_path = sibling(realm_path, "note");
        let session = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&note_path)
            .map_err(|e| CoreError::from_io(&note_path, &e))?;
        session
            .lock_shared()
            .map_err(|e| CoreError::from_io(&note_path, &e))?;

        Ok(Arc::new(Self {
            lock_path,
            writer,
            session,
        }))
    }

    /// Blocks until no other process is writing.
    pub fn lock_write(self: &Arc<Self>) -> CoreResult<FileWriteGuard> {
        self.writer
            .lock_exclusive()
            .map_err(|e| CoreError::from_io(&self.lock_path, &e))?;
        Ok(FileWriteGuard {
            locks: Arc::clone(self),
        })
    }

    /// Runs `f` only if no other process has the realm open.
    ///
    /// Returns `None` when another process holds a session.
    pub fn with_sole_session<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        if self.session.try_lock_exclusive().is_err() {
            return None;
        }
        let result = f();
        if let Err(err) = self.session.lock_shared() {
            tracing::warn!(target: "realm.storage", error = %err, "failed to downgrade session lock");
        }
        Some(result)
    }
}

impl Drop for FileWriteGuard {
    fn drop(&mut self) {
        if let Err(err) = self.locks.writer.unlock() {
            tracing::warn!(target: "realm.storage", error = %err, "failed to release write lock");
        }
    }
}

fn check_header(file: &mut File, path: &Path) -> CoreResult<()> {
    let io_err = |e: std::io::Error| CoreError::from_io(path, &e);
    // Another opener may be writing the header concurrently.
    file.lock_exclusive().map_err(io_err)?;
    let result = (|| {
        let mut existing = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut existing)?;
        if existing.is_empty() {
            file.write_all(LOCK_HEADER)?;
            file.sync_all()?;
            return Ok(None);
        }
        Ok(Some(existing))
    })();
    let unlocked = file.unlock();
    let existing = result.map_err(io_err)?;
    unlocked.map_err(io_err)?;
    match existing {
        Some(bytes) if !bytes.starts_with(LOCK_HEADER) => Err(CoreError::IncompatibleLockFile {
            path: path.to_path_buf(),
            message: format!(
                "expected header {:?}, found {:?}",
                String::from_utf8_lossy(LOCK_HEADER),
                String::from_utf8_lossy(&bytes[..bytes.len().min(LOCK_HEADER.len())])
            ),
        }),
        _ => Ok(()),
    }
}

/// `<realm path>.<ext>`.
pub(crate) fn sibling(realm_path: &Path, ext: &str) -> PathBuf {
    let mut name = realm_path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn write_lock_is_exclusive() {
        let lock = Arc::new(WriteLock::default());
        let guard = lock.acquire();
        assert!(lock.is_held());
        drop(guard);
        assert!(!lock.is_held());
        let _again = lock.acquire();
        assert!(lock.is_held());
    }

    #[test]
    fn waiting_writer_wakes_on_release() {
        let lock = Arc::new(WriteLock::default());
        let guard = lock.acquire();
        let other = Arc::clone(&lock);
        let waiter = std::thread::spawn(move || {
            let _guard = other.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn guard_moves_across_threads() {
        let lock = Arc::new(WriteLock::default());
        let guard = lock.acquire();
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn foreign_lock_file_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let realm = dir.path().join("db.realm");
        std::fs::write(sibling(&realm, "lock"), b"SOMETHING ELSE").unwrap();
        let err = FileLocks::open(&realm).unwrap_err();
        assert!(matches!(err, CoreError::IncompatibleLockFile { .. }));
    }

    #[test]
    fn lock_file_header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let realm = dir.path().join("db.realm");
        let first = FileLocks::open(&realm).unwrap();
        let second = FileLocks::open(&realm).unwrap();
        assert_eq!(std::fs::read(sibling(&realm, "lock")).unwrap(), LOCK_HEADER);
        {
            let _guard = first.lock_write().unwrap();
        }
        let _guard = second.lock_write().unwrap();
    }

    #[test]
    fn sole_session_requires_no_other_openers() {
        let dir = tempfile::tempdir().unwrap();
        let realm = dir.path().join("db.realm");
        let first = FileLocks::open(&realm).unwrap();
        assert_eq!(first.with_sole_session(|| 1), Some(1));
        let _second = FileLocks::open(&realm).unwrap();
        assert_eq!(first.with_sole_session(|| 1), None);
    }
}
