//! The commit log: the on-disk form of a realm.
//!
//! A log starts with one snapshot record holding the full state, followed by
//! one commit record per write transaction. Opening replays the log; a torn
//! tail left by a crash is truncated back to the last complete record.
//! Compaction rewrites the log as a single snapshot record.

use crate::error::{CoreError, CoreResult};
use crate::storage::apply::apply;
use crate::storage::instruction::{CommitChanges, Instruction};
use crate::storage::snapshot::SnapshotData;
use crate::types::VersionId;
use realmdb_codec::{from_cbor, to_cbor, Frame, FrameReader, FrameWriter};
use realmdb_storage::StorageBackend;
use serde::{Deserialize, Serialize};

const LOG_MAGIC: [u8; 4] = *b"RLMC";
const LOG_VERSION: u16 = 1;

const KIND_SNAPSHOT: u8 = 1;
const KIND_COMMIT: u8 = 2;

/// Who produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitOrigin {
    /// A local write transaction.
    #[default]
    Local,
    /// Changes integrated from a sync server.
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub version: VersionId,
    pub origin: CommitOrigin,
    pub instructions: Vec<Instruction>,
}

/// Summary of one log record, for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A full snapshot.
    Snapshot {
        /// Byte offset in the log.
        offset: u64,
        /// Version captured.
        version: VersionId,
        /// Number of classes.
        classes: usize,
        /// Number of objects across all classes.
        objects: usize,
    },
    /// A committed write transaction.
    Commit {
        /// Byte offset in the log.
        offset: u64,
        /// Version produced.
        version: VersionId,
        /// Producer.
        origin: CommitOrigin,
        /// Instruction tags, in order.
        instructions: Vec<&'static str>,
    },
}

/// Result of scanning a log without replaying it.
#[derive(Debug, Clone, Default)]
pub struct LogReport {
    /// Records in order.
    pub entries: Vec<LogEntry>,
    /// Bytes covered by complete records.
    pub valid_len: u64,
    /// Total bytes in the file.
    pub total_len: u64,
    /// Why scanning stopped early, if it did.
    pub tail_error: Option<String>,
}

pub(crate) struct CommitLog {
    backend: Box<dyn StorageBackend>,
    /// Bytes already folded into the in-memory state.
    applied: u64,
    sync_on_commit: bool,
}

fn writer() -> FrameWriter {
    FrameWriter::new(LOG_MAGIC, LOG_VERSION)
}

fn reader() -> FrameReader {
    FrameReader::new(LOG_MAGIC, LOG_VERSION)
}

impl CommitLog {
    /// Opens a log and replays it.
    ///
    /// An empty backend is initialized with an empty snapshot unless
    /// `writable` is false.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        writable: bool,
        sync_on_commit: bool,
    ) -> CoreResult<(Self, SnapshotData)> {
        let mut log = Self {
            backend,
            applied: 0,
            sync_on_commit,
        };
        let bytes = log.backend.read_all()?;
        if bytes.is_empty() {
            let snap = SnapshotData::empty();
            if writable {
                log.write_snapshot(&snap)?;
            }
            return Ok((log, snap));
        }

        let scan = reader().scan(&bytes);
        let mut frames = scan.frames.into_iter();
        let first = frames.next().ok_or_else(|| {
            CoreError::invalid_database(match &scan.tail_error {
                Some(err) => format!("not a realm commit log: {err}"),
                None => "not a realm commit log".to_string(),
            })
        })?;
        let mut snap = decode_snapshot(&first)?;
        let mut commits = 0usize;
        for frame in frames {
            replay_frame(&mut snap, &frame)?;
            commits += 1;
        }

        if let Some(err) = scan.tail_error {
            tracing::warn!(
                target: "realm.storage",
                valid_len = scan.valid_len,
                total_len = bytes.len(),
                error = %err,
                "discarding incomplete tail of commit log"
            );
            if writable {
                log.backend.truncate(scan.valid_len)?;
                log.backend.sync()?;
            }
        }
        log.applied = scan.valid_len;
        tracing::debug!(
            target: "realm.storage",
            version = %snap.version,
            commits,
            "replayed commit log"
        );
        Ok((log, snap))
    }

    /// Folds records appended by other processes into `snap`.
    ///
    /// Returns the accumulated changes, or `None` if nothing new was found.
    pub fn catch_up(&mut self, snap: &mut SnapshotData) -> CoreResult<Option<CommitChanges>> {
        let size = self.backend.size()?;
        if size == self.applied {
            return Ok(None);
        }
        if size < self.applied {
            let bytes = self.backend.read_all()?;
            let scan = reader().scan(&bytes);
            let mut frames = scan.frames.into_iter();
            let first = frames
                .next()
                .ok_or_else(|| CoreError::invalid_database("commit log was emptied"))?;
            let mut fresh = decode_snapshot(&first)?;
            for frame in frames {
                replay_frame(&mut fresh, &frame)?;
            }
            *snap = fresh;
            self.applied = scan.valid_len;
            return Ok(Some(CommitChanges {
                schema_changed: true,
                ..CommitChanges::default()
            }));
        }

        let tail = self
            .backend
            .read_at(self.applied, (size - self.applied) as usize)?;
        let scan = reader().scan(&tail);
        if scan.frames.is_empty() {
            return Ok(None);
        }
        let mut changes = CommitChanges::default();
        for frame in &scan.frames {
            match frame.kind {
                KIND_COMMIT => {
                    let record: CommitRecord = from_cbor(&frame.payload)?;
                    for instruction in &record.instructions {
                        apply(snap, instruction, record.version.version, &mut changes)?;
                    }
                    snap.version = record.version;
                }
                KIND_SNAPSHOT => {
                    *snap = decode_snapshot(frame)?;
                    changes.schema_changed = true;
                }
                other => {
                    return Err(CoreError::invalid_database(format!(
                        "unknown log record kind {other}"
                    )))
                }
            }
        }
        self.applied += scan.valid_len;
        tracing::trace!(
            target: "realm.storage",
            version = %snap.version,
            "caught up with external commits"
        );
        Ok(Some(changes))
    }

    /// Durably appends a commit record.
    ///
    /// On failure the log is truncated back to where it was.
    pub fn append(&mut self, record: &CommitRecord) -> CoreResult<()> {
        let payload = to_cbor(record)?;
        let frame = writer().encode(KIND_COMMIT, &payload)?;
        let offset = self.backend.append(&frame)?;
        let durable = if self.sync_on_commit {
            self.backend.flush().and_then(|()| self.backend.sync())
        } else {
            self.backend.flush()
        };
        if let Err(err) = durable {
            if let Err(undo) = self.backend.truncate(offset) {
                tracing::error!(
                    target: "realm.storage",
                    error = %undo,
                    "failed to roll back partial commit"
                );
            }
            return Err(err.into());
        }
        self.applied = offset + frame.len() as u64;
        Ok(())
    }

    /// Replaces the whole log with a snapshot of `snap`.
    pub fn compact(&mut self, snap: &SnapshotData) -> CoreResult<()> {
        let before = self.backend.size()?;
        let payload = to_cbor(snap)?;
        let frame = writer().encode(KIND_SNAPSHOT, &payload)?;
        self.backend.replace_all(&frame)?;
        self.applied = frame.len() as u64;
        tracing::info!(
            target: "realm.storage",
            before,
            after = self.applied,
            "compacted commit log"
        );
        Ok(())
    }

    fn write_snapshot(&mut self, snap: &SnapshotData) -> CoreResult<()> {
        let payload = to_cbor(snap)?;
        let frame = writer().encode(KIND_SNAPSHOT, &payload)?;
        self.backend.append(&frame)?;
        self.backend.flush()?;
        self.backend.sync()?;
        self.applied = frame.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

/// Size of `snap` written as a single snapshot record.
pub(crate) fn snapshot_len(snap: &SnapshotData) -> CoreResult<u64> {
    let payload = to_cbor(snap)?;
    Ok(writer().encode(KIND_SNAPSHOT, &payload)?.len() as u64)
}

/// Replaces whatever `backend` holds with a log of just `snap`.
pub(crate) fn write_fresh(backend: &mut dyn StorageBackend, snap: &SnapshotData) -> CoreResult<()> {
    let payload = to_cbor(snap)?;
    let frame = writer().encode(KIND_SNAPSHOT, &payload)?;
    backend.replace_all(&frame)?;
    backend.sync()?;
    Ok(())
}

/// Scans a log and describes its records without building any state.
pub(crate) fn describe(backend: &dyn StorageBackend) -> CoreResult<LogReport> {
    let bytes = backend.read_all()?;
    let scan = reader().scan(&bytes);
    let mut entries = Vec::with_capacity(scan.frames.len());
    for frame in &scan.frames {
        entries.push(match frame.kind {
            KIND_SNAPSHOT => {
                let snap: SnapshotData = from_cbor(&frame.payload)?;
                LogEntry::Snapshot {
                    offset: frame.offset,
                    version: snap.version,
                    classes: snap.tables.len(),
                    objects: snap.tables.values().map(|t| t.len()).sum(),
                }
            }
            _ => {
                let record: CommitRecord = from_cbor(&frame.payload)?;
                LogEntry::Commit {
                    offset: frame.offset,
                    version: record.version,
                    origin: record.origin,
                    instructions: record.instructions.iter().map(Instruction::name).collect(),
                }
            }
        });
    }
    Ok(LogReport {
        entries,
        valid_len: scan.valid_len,
        total_len: bytes.len() as u64,
        tail_error: scan.tail_error.map(|e| e.to_string()),
    })
}

fn decode_snapshot(frame: &Frame) -> CoreResult<SnapshotData> {
    if frame.kind != KIND_SNAPSHOT {
        return Err(CoreError::invalid_database(
            "commit log does not start with a snapshot",
        ));
    }
    let mut snap: SnapshotData = from_cbor(&frame.payload)?;
    snap.rebuild_derived();
    Ok(snap)
}

fn replay_frame(snap: &mut SnapshotData, frame: &Frame) -> CoreResult<()> {
    match frame.kind {
        KIND_COMMIT => {
            let record: CommitRecord = from_cbor(&frame.payload)?;
            let mut changes = CommitChanges::default();
            for instruction in &record.instructions {
                apply(snap, instruction, record.version.version, &mut changes)?;
            }
            snap.version = record.version;
            Ok(())
        }
        KIND_SNAPSHOT => {
            *snap = decode_snapshot(frame)?;
            Ok(())
        }
        other => Err(CoreError::invalid_database(format!(
            "unknown log record kind {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, Property, PropertyType};
    use crate::storage::slot::Slot;
    use crate::types::{ClassKey, ObjKey, PropertyKey};
    use crate::value::Value;
    use realmdb_storage::InMemoryBackend;

    fn class_schema() -> ObjectSchema {
        let mut schema =
            ObjectSchema::new("Item").property(Property::new("n", PropertyType::Int));
        schema.key = Some(ClassKey(0));
        schema.persisted_properties[0].key = PropertyKey(0);
        schema
    }

    fn commit(version: u64, instructions: Vec<Instruction>) -> CommitRecord {
        CommitRecord {
            version: VersionId::new(version, version - 1),
            origin: CommitOrigin::Local,
            instructions,
        }
    }

    #[test]
    fn replays_commits_on_open() {
        let backend = InMemoryBackend::new();
        let (mut log, _) = CommitLog::open(Box::new(backend.clone()), true, false).unwrap();
        log.append(&commit(2, vec![Instruction::AddClass { schema: class_schema() }]))
            .unwrap();
        log.append(&commit(
            3,
            vec![Instruction::CreateObject {
                class: ClassKey(0),
                key: ObjKey(0),
                primary_key: None,
            }],
        ))
        .unwrap();

        let (_, snap) = CommitLog::open(Box::new(backend), true, false).unwrap();
        assert_eq!(snap.version, VersionId::new(3, 2));
        assert_eq!(snap.table(ClassKey(0)).unwrap().len(), 1);
        assert_eq!(snap.class_key("Item"), Some(ClassKey(0)));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = InMemoryBackend::new();
        let (mut log, _) = CommitLog::open(Box::new(backend.clone()), true, false).unwrap();
        log.append(&commit(2, vec![Instruction::AddClass { schema: class_schema() }]))
            .unwrap();
        let good = log.size().unwrap();

        let mut raw = backend.clone();
        raw.append(b"RLMC\x01\x00\x02garbage").unwrap();

        let (log, snap) = CommitLog::open(Box::new(backend), true, false).unwrap();
        assert_eq!(log.size().unwrap(), good);
        assert_eq!(snap.version.version, 2);
    }

    #[test]
    fn garbage_file_is_rejected() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"definitely not a realm").unwrap();
        let err = CommitLog::open(Box::new(backend), true, false).err().unwrap();
        assert!(matches!(err, CoreError::InvalidDatabase { .. }));
    }

    #[test]
    fn catch_up_sees_other_writers() {
        let backend = InMemoryBackend::new();
        let (mut reader_log, mut snap) =
            CommitLog::open(Box::new(backend.clone()), true, false).unwrap();
        let (mut writer_log, _) = CommitLog::open(Box::new(backend), true, false).unwrap();

        assert!(reader_log.catch_up(&mut snap).unwrap().is_none());
        writer_log
            .append(&commit(2, vec![Instruction::AddClass { schema: class_schema() }]))
            .unwrap();
        writer_log
            .append(&commit(
                3,
                vec![
                    Instruction::CreateObject {
                        class: ClassKey(0),
                        key: ObjKey(0),
                        primary_key: None,
                    },
                    Instruction::SetProperty {
                        class: ClassKey(0),
                        key: ObjKey(0),
                        property: PropertyKey(0),
                        slot: Slot::Value(Value::Int(5)),
                    },
                ],
            ))
            .unwrap();

        let changes = reader_log.catch_up(&mut snap).unwrap().unwrap();
        assert!(changes.schema_changed);
        assert_eq!(changes.created.len(), 1);
        assert_eq!(snap.version.version, 3);
        let obj = snap.object(ClassKey(0), ObjKey(0)).unwrap();
        assert_eq!(obj.value(PropertyKey(0)), Value::Int(5));
        assert!(reader_log.catch_up(&mut snap).unwrap().is_none());
    }

    #[test]
    fn compaction_keeps_state() {
        let backend = InMemoryBackend::new();
        let (mut log, mut snap) = CommitLog::open(Box::new(backend.clone()), true, false).unwrap();
        let record = commit(2, vec![Instruction::AddClass { schema: class_schema() }]);
        for instruction in &record.instructions {
            apply(&mut snap, instruction, 2, &mut CommitChanges::default()).unwrap();
        }
        snap.version = record.version;
        log.append(&record).unwrap();
        log.compact(&snap).unwrap();

        let report = describe(&backend).unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!(matches!(
            report.entries[0],
            LogEntry::Snapshot { classes: 1, .. }
        ));
        let (_, reopened) = CommitLog::open(Box::new(backend), true, false).unwrap();
        assert_eq!(reopened.version, snap.version);
    }
}
