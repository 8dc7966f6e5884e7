//! Client-side sync history: identity, progress and unacknowledged local
//! changes of one realm file.

use crate::error::SyncResult;
use realmdb_codec::{from_cbor, to_cbor, FrameReader, FrameWriter};
use realmdb_sync_protocol::{Changeset, DownloadCursor, FileIdent, PrimaryKeyValue, SyncOperation, UploadCursor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"RSYH";
const FORMAT_VERSION: u16 = 1;
const KIND_STATE: u8 = 1;

/// A path next to `path` with `.{ext}` appended.
pub(crate) fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct HistoryState {
    file_ident: Option<FileIdent>,
    client_version: u64,
    acknowledged: u64,
    download: DownloadCursor,
    pending: Vec<Changeset>,
    uploadable_bytes: u64,
    uploaded_bytes: u64,
}

/// Sync bookkeeping of one realm, kept in `<realm>.sync`.
///
/// Local commits become changesets with increasing client versions. They
/// stay pending until a download acknowledges them. In-memory realms keep
/// their history in memory only.
#[derive(Debug)]
pub(crate) struct ClientHistory {
    path: Option<PathBuf>,
    state: HistoryState,
    sent: u64,
}

impl ClientHistory {
    /// Loads the history of the realm at `realm_path`.
    pub fn load(realm_path: &Path, in_memory: bool) -> SyncResult<Self> {
        if in_memory {
            return Ok(Self::in_memory());
        }
        let path = sidecar(realm_path, "sync");
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let frame = FrameReader::new(MAGIC, FORMAT_VERSION).decode_one(&bytes)?;
                from_cbor(&frame.payload)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HistoryState::default(),
            Err(err) => return Err(err.into()),
        };
        let sent = state.acknowledged;
        Ok(Self {
            path: Some(path),
            state,
            sent,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: HistoryState::default(),
            sent: 0,
        }
    }

    /// Writes the history next to the realm.
    pub fn save(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let frame = FrameWriter::new(MAGIC, FORMAT_VERSION).encode(KIND_STATE, &to_cbor(&self.state)?)?;
        let tmp = sidecar(path, "tmp");
        std::fs::write(&tmp, frame)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn file_ident(&self) -> Option<FileIdent> {
        self.state.file_ident
    }

    pub fn set_file_ident(&mut self, ident: FileIdent) {
        self.state.file_ident = Some(ident);
    }

    pub fn download(&self) -> DownloadCursor {
        self.state.download
    }

    pub fn set_download(&mut self, cursor: DownloadCursor) {
        if cursor.server_version >= self.state.download.server_version {
            self.state.download = cursor;
        }
    }

    pub fn client_version(&self) -> u64 {
        self.state.client_version
    }

    pub fn acknowledged(&self) -> u64 {
        self.state.acknowledged
    }

    /// Records a local commit. Returns its client version.
    pub fn record_local(&mut self, operations: Vec<SyncOperation>, timestamp: i64) -> SyncResult<u64> {
        self.state.client_version += 1;
        let changeset = Changeset {
            client_version: self.state.client_version,
            last_integrated_server_version: self.state.download.server_version,
            origin_timestamp: timestamp,
            operations,
        };
        self.state.uploadable_bytes += changeset.encoded_size()?;
        self.state.pending.push(changeset);
        Ok(self.state.client_version)
    }

    /// Pending changesets not yet sent on this connection, with the upload
    /// cursor that covers them.
    pub fn unsent(&self) -> (UploadCursor, Vec<Changeset>) {
        let changesets = self
            .state
            .pending
            .iter()
            .filter(|c| c.client_version > self.sent)
            .cloned()
            .collect();
        let cursor = UploadCursor {
            client_version: self.state.client_version,
            last_integrated_server_version: self.state.download.server_version,
        };
        (cursor, changesets)
    }

    pub fn mark_sent(&mut self, version: u64) {
        self.sent = self.sent.max(version);
    }

    /// Forgets what was sent; a new connection resends every pending
    /// changeset.
    pub fn rewind_sent(&mut self) {
        self.sent = self.state.acknowledged;
    }

    /// Drops pending changesets up to `version`. Returns whether anything
    /// changed.
    pub fn acknowledge(&mut self, version: u64) -> bool {
        let version = version.min(self.state.client_version);
        if version <= self.state.acknowledged {
            return false;
        }
        self.state.acknowledged = version;
        let mut acked_bytes = 0;
        self.state.pending.retain(|c| {
            if c.client_version <= version {
                acked_bytes += c.encoded_size().unwrap_or(0);
                false
            } else {
                true
            }
        });
        self.state.uploaded_bytes += acked_bytes;
        self.sent = self.sent.max(version);
        true
    }

    pub fn has_unacknowledged(&self) -> bool {
        !self.state.pending.is_empty()
    }

    /// Objects with local changes the server has not acknowledged.
    pub fn pending_keys(&self) -> BTreeSet<(String, PrimaryKeyValue)> {
        self.state
            .pending
            .iter()
            .flat_map(|c| &c.operations)
            .map(|op| (op.class().to_owned(), op.key().clone()))
            .collect()
    }

    #[cfg(test)]
    pub fn pending(&self) -> &[Changeset] {
        &self.state.pending
    }

    /// `(uploaded, uploadable)` bytes.
    pub fn upload_progress(&self) -> (u64, u64) {
        (self.state.uploaded_bytes, self.state.uploadable_bytes)
    }

    /// Forgets identity, progress and pending changes, as after a client
    /// reset. Returns the pending changesets.
    pub fn reset(&mut self) -> Vec<Changeset> {
        let pending = std::mem::take(&mut self.state.pending);
        self.state = HistoryState::default();
        self.sent = 0;
        pending
    }

    /// Deletes the history file of the realm at `realm_path`.
    pub fn delete_file(realm_path: &Path) -> SyncResult<bool> {
        match std::fs::remove_file(sidecar(realm_path, "sync")) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
