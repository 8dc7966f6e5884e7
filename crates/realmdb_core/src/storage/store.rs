//! The versioned store shared by every realm handle on one file.

use crate::error::{CoreError, CoreResult};
use crate::storage::apply::apply;
use crate::storage::instruction::{CommitChanges, Instruction};
use crate::storage::lock::{FileLocks, FileWriteGuard, WriteLock, WriteLockGuard};
use crate::storage::log::{
    describe, snapshot_len, write_fresh, CommitLog, CommitOrigin, CommitRecord, LogReport,
};
use crate::storage::snapshot::SnapshotData;
use crate::types::VersionId;
use parking_lot::{Mutex, RwLock};
use realmdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback run after every commit, outside of any store lock.
pub(crate) type CommitObserver = Arc<dyn Fn(&CommitEvent) + Send + Sync>;

/// A commit that just became visible.
#[derive(Clone)]
pub struct CommitEvent {
    pub(crate) version: VersionId,
    pub(crate) origin: CommitOrigin,
    pub(crate) changes: Arc<CommitChanges>,
    pub(crate) snapshot: Arc<SnapshotData>,
}

impl CommitEvent {
    /// Version produced by the commit.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Who produced the commit.
    #[must_use]
    pub fn origin(&self) -> CommitOrigin {
        self.origin
    }

    /// What the commit touched.
    #[must_use]
    pub fn changes(&self) -> &CommitChanges {
        &self.changes
    }
}

impl std::fmt::Debug for CommitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitEvent")
            .field("version", &self.version)
            .field("origin", &self.origin)
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoreOptions {
    pub writable: bool,
    pub max_versions: u64,
    pub sync_on_commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            writable: true,
            max_versions: u64::MAX,
            sync_on_commit: true,
        }
    }
}

pub(crate) struct Store {
    path: Option<PathBuf>,
    log: Mutex<CommitLog>,
    latest: RwLock<Arc<SnapshotData>>,
    write_lock: Arc<WriteLock>,
    files: Option<Arc<FileLocks>>,
    pins: Mutex<BTreeMap<VersionId, usize>>,
    observers: Mutex<Vec<(u64, CommitObserver)>>,
    next_observer: AtomicU64,
    options: StoreOptions,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("version", &self.latest.read().version)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens the realm file at `path`, creating it when writable.
    pub fn open_file(path: &Path, options: StoreOptions) -> CoreResult<Arc<Self>> {
        if !options.writable && !path.exists() {
            return Err(CoreError::file_access(path, "file does not exist"));
        }
        let backend = FileBackend::open_with_create_dirs(path).map_err(|e| match e {
            realmdb_storage::StorageError::Io(io) => CoreError::from_io(path, &io),
            other => other.into(),
        })?;
        let files = if options.writable {
            Some(FileLocks::open(path)?)
        } else {
            None
        };
        let _guard = files.as_ref().map(FileLocks::lock_write).transpose()?;
        let (log, snap) = CommitLog::open(Box::new(backend), options.writable, options.sync_on_commit)?;
        tracing::debug!(
            target: "realm.storage",
            path = %path.display(),
            version = %snap.version,
            "opened realm file"
        );
        Ok(Arc::new(Self::new(Some(path.to_path_buf()), log, snap, files, options)))
    }

    /// Opens a store backed by memory only.
    pub fn open_memory(options: StoreOptions) -> CoreResult<Arc<Self>> {
        Self::open_backend(Box::new(InMemoryBackend::new()), options)
    }

    /// Opens a store over an arbitrary backend.
    pub fn open_backend(
        backend: Box<dyn StorageBackend>,
        options: StoreOptions,
    ) -> CoreResult<Arc<Self>> {
        let (log, snap) = CommitLog::open(backend, true, options.sync_on_commit)?;
        Ok(Arc::new(Self::new(None, log, snap, None, options)))
    }

    fn new(
        path: Option<PathBuf>,
        log: CommitLog,
        snap: SnapshotData,
        files: Option<Arc<FileLocks>>,
        options: StoreOptions,
    ) -> Self {
        Self {
            path,
            log: Mutex::new(log),
            latest: RwLock::new(Arc::new(snap)),
            write_lock: Arc::new(WriteLock::default()),
            files,
            pins: Mutex::new(BTreeMap::new()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            options,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable
    }

    /// The newest version known to this process.
    pub fn latest(&self) -> Arc<SnapshotData> {
        Arc::clone(&self.latest.read())
    }

    /// Picks up commits made by other processes.
    ///
    /// Returns whether a newer version became available.
    pub fn refresh(&self) -> CoreResult<bool> {
        let event = {
            let mut log = self.log.lock();
            let mut snap = (*self.latest()).clone();
            let Some(changes) = log.catch_up(&mut snap)? else {
                return Ok(false);
            };
            let snap = Arc::new(snap);
            *self.latest.write() = Arc::clone(&snap);
            CommitEvent {
                version: snap.version,
                origin: CommitOrigin::Local,
                changes: Arc::new(changes),
                snapshot: snap,
            }
        };
        self.notify(&event);
        Ok(true)
    }

    /// Pins the newest version.
    pub fn pin_latest(self: &Arc<Self>) -> CoreResult<PinnedSnapshot> {
        self.pin(self.latest())
    }

    /// Keeps `snap` alive and counts it against the version limit.
    pub fn pin(self: &Arc<Self>, snap: Arc<SnapshotData>) -> CoreResult<PinnedSnapshot> {
        let mut pins = self.pins.lock();
        let version = snap.version;
        if !pins.contains_key(&version) && pins.len() as u64 >= self.options.max_versions {
            return Err(CoreError::VersionLimitExceeded {
                active: pins.len() as u64 + 1,
                limit: self.options.max_versions,
            });
        }
        *pins.entry(version).or_insert(0) += 1;
        Ok(PinnedSnapshot {
            store: Arc::clone(self),
            snap,
        })
    }

    fn unpin(&self, version: VersionId) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }

    /// Number of distinct versions currently pinned.
    pub fn num_versions(&self) -> usize {
        self.pins.lock().len()
    }

    /// Blocks until this thread is the only writer, then starts a transaction
    /// on the newest version.
    pub fn begin_write(self: &Arc<Self>, origin: CommitOrigin) -> CoreResult<WriteTxn> {
        self.ensure_writable()?;
        let guard = self.write_lock.acquire();
        self.start_write(guard, origin)
    }

    pub fn is_write_locked(&self) -> bool {
        self.write_lock.is_held()
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.options.writable {
            Ok(())
        } else {
            Err(CoreError::read_only("realm was opened read-only"))
        }
    }

    fn start_write(self: &Arc<Self>, guard: WriteLockGuard, origin: CommitOrigin) -> CoreResult<WriteTxn> {
        let file_guard = self.files.as_ref().map(FileLocks::lock_write).transpose()?;
        self.refresh()?;
        let base = self.latest();
        tracing::trace!(
            target: "realm.storage.transaction",
            version = %base.version,
            "begin write"
        );
        Ok(WriteTxn {
            store: Arc::clone(self),
            working: (*base).clone(),
            base,
            instructions: Vec::new(),
            changes: CommitChanges::default(),
            origin,
            _file_guard: file_guard,
            _guard: guard,
        })
    }

    /// Registers a commit observer.
    pub fn add_observer(&self, observer: CommitObserver) -> u64 {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: u64) {
        self.observers.lock().retain(|(i, _)| *i != id);
    }

    fn notify(&self, event: &CommitEvent) {
        let observers: Vec<CommitObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    /// Rewrites the log as a single snapshot record.
    ///
    /// Returns false without doing anything when another process has the
    /// realm open.
    pub fn compact(self: &Arc<Self>) -> CoreResult<bool> {
        self.ensure_writable()?;
        let _guard = self.write_lock.acquire();
        let _file_guard = self.files.as_ref().map(FileLocks::lock_write).transpose()?;
        self.refresh()?;
        let run = || -> CoreResult<()> {
            let mut snap = (*self.latest()).clone();
            snap.version.index = 0;
            self.log.lock().compact(&snap)?;
            *self.latest.write() = Arc::new(snap);
            Ok(())
        };
        match &self.files {
            Some(files) => match files.with_sole_session(run) {
                Some(result) => result.map(|()| true),
                None => Ok(false),
            },
            None => run().map(|()| true),
        }
    }

    /// Current size of the commit log in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.lock().size()
    }

    /// Bytes the log would take after compaction.
    pub fn used_size(&self) -> CoreResult<u64> {
        snapshot_len(&self.latest())
    }
}

/// Writes `snap` as a new realm file at `path`, replacing its contents.
pub(crate) fn write_copy(path: &Path, snap: &SnapshotData) -> CoreResult<()> {
    let mut backend = FileBackend::open_with_create_dirs(path).map_err(|e| match e {
        realmdb_storage::StorageError::Io(io) => CoreError::from_io(path, &io),
        other => other.into(),
    })?;
    let mut copy = snap.clone();
    copy.version.index = 0;
    write_fresh(&mut backend, &copy)
}

/// Scans a realm file without opening it.
pub(crate) fn describe_file(path: &Path) -> CoreResult<LogReport> {
    if !path.exists() {
        return Err(CoreError::file_access(path, "file does not exist"));
    }
    let backend = FileBackend::open(path)?;
    describe(&backend)
}

/// A version kept alive for a reader.
pub(crate) struct PinnedSnapshot {
    store: Arc<Store>,
    snap: Arc<SnapshotData>,
}

impl PinnedSnapshot {
    pub fn data(&self) -> &Arc<SnapshotData> {
        &self.snap
    }

    pub fn version(&self) -> VersionId {
        self.snap.version
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Another pin on the same version.
    pub fn duplicate(&self) -> PinnedSnapshot {
        *self.store.pins.lock().entry(self.snap.version).or_insert(0) += 1;
        PinnedSnapshot {
            store: Arc::clone(&self.store),
            snap: Arc::clone(&self.snap),
        }
    }
}

impl Drop for PinnedSnapshot {
    fn drop(&mut self) {
        self.store.unpin(self.snap.version);
    }
}

impl std::fmt::Debug for PinnedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PinnedSnapshot").field(&self.snap.version).finish()
    }
}

/// An exclusive mutation context.
///
/// Dropping a transaction without committing rolls it back.
pub(crate) struct WriteTxn {
    store: Arc<Store>,
    base: Arc<SnapshotData>,
    working: SnapshotData,
    instructions: Vec<Instruction>,
    changes: CommitChanges,
    origin: CommitOrigin,
    _file_guard: Option<FileWriteGuard>,
    _guard: WriteLockGuard,
}

impl std::fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("base", &self.base.version)
            .field("instructions", &self.instructions.len())
            .finish_non_exhaustive()
    }
}

impl WriteTxn {
    /// State including this transaction's changes so far.
    pub fn snapshot(&self) -> &SnapshotData {
        &self.working
    }

    /// The version this transaction started from.
    pub fn base(&self) -> &Arc<SnapshotData> {
        &self.base
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn changes(&self) -> &CommitChanges {
        &self.changes
    }

    /// Applies and records one instruction.
    pub fn apply(&mut self, instruction: Instruction) -> CoreResult<()> {
        let stamp = self.base.version.version + 1;
        apply(&mut self.working, &instruction, stamp, &mut self.changes)?;
        tracing::trace!(
            target: "realm.storage.transaction",
            instruction = instruction.name(),
            "applied"
        );
        self.instructions.push(instruction);
        Ok(())
    }

    /// Allocates an element or collection id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.working.next_id;
        self.working.next_id += 1;
        id
    }

    /// Makes the transaction durable and visible as a new version.
    pub fn commit(self) -> CoreResult<CommitEvent> {
        let Self {
            store,
            base,
            mut working,
            instructions,
            changes,
            origin,
            _file_guard,
            _guard,
        } = self;
        let version = base.version.next();
        working.version = version;
        let record = CommitRecord {
            version,
            origin,
            instructions,
        };
        let snapshot = {
            let mut log = store.log.lock();
            log.append(&record)?;
            let snapshot = Arc::new(working);
            *store.latest.write() = Arc::clone(&snapshot);
            snapshot
        };
        drop(_file_guard);
        drop(_guard);
        tracing::debug!(
            target: "realm.storage.transaction",
            version = %version,
            instructions = record.instructions.len(),
            ?origin,
            "committed"
        );
        let event = CommitEvent {
            version,
            origin,
            changes: Arc::new(changes),
            snapshot,
        };
        store.notify(&event);
        Ok(event)
    }

    /// Discards the transaction.
    pub fn rollback(self) {
        tracing::trace!(
            target: "realm.storage.transaction",
            version = %self.base.version,
            discarded = self.instructions.len(),
            "rollback"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, Property, PropertyType};
    use crate::storage::slot::Slot;
    use crate::types::{ClassKey, ObjKey, PropertyKey};
    use crate::value::Value;

    fn add_items(txn: &mut WriteTxn) {
        let mut schema = ObjectSchema::new("Item").property(Property::new("n", PropertyType::Int));
        schema.key = Some(ClassKey(0));
        schema.persisted_properties[0].key = PropertyKey(0);
        txn.apply(Instruction::AddClass { schema }).unwrap();
    }

    fn create(txn: &mut WriteTxn, key: i64, n: i64) {
        txn.apply(Instruction::CreateObject {
            class: ClassKey(0),
            key: ObjKey(key),
            primary_key: None,
        })
        .unwrap();
        txn.apply(Instruction::SetProperty {
            class: ClassKey(0),
            key: ObjKey(key),
            property: PropertyKey(0),
            slot: Slot::Value(Value::Int(n)),
        })
        .unwrap();
    }

    #[test]
    fn readers_keep_their_version() {
        let store = Store::open_memory(StoreOptions::default()).unwrap();
        let mut txn = store.begin_write(CommitOrigin::Local).unwrap();
        add_items(&mut txn);
        create(&mut txn, 0, 1);
        txn.commit().unwrap();

        let reader = store.pin_latest().unwrap();
        let mut txn = store.begin_write(CommitOrigin::Local).unwrap();
        create(&mut txn, 1, 2);
        txn.commit().unwrap();

        assert_eq!(reader.data().table(ClassKey(0)).unwrap().len(), 1);
        assert_eq!(store.latest().table(ClassKey(0)).unwrap().len(), 2);
        assert!(store.latest().version > reader.version());
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let store = Store::open_memory(StoreOptions::default()).unwrap();
        let before = store.latest().version;
        let mut txn = store.begin_write(CommitOrigin::Local).unwrap();
        add_items(&mut txn);
        txn.rollback();
        assert_eq!(store.latest().version, before);
        assert!(store.latest().tables.is_empty());
        assert!(!store.is_write_locked());
    }

    #[test]
    fn version_limit_is_enforced() {
        let store = Store::open_memory(StoreOptions {
            max_versions: 2,
            ..StoreOptions::default()
        })
        .unwrap();
        let first = store.pin_latest().unwrap();
        let _again = store.pin_latest().unwrap();
        store.begin_write(CommitOrigin::Local).unwrap().commit().unwrap();
        let _second = store.pin_latest().unwrap();
        store.begin_write(CommitOrigin::Local).unwrap().commit().unwrap();
        let err = store.pin_latest().unwrap_err();
        assert!(matches!(err, CoreError::VersionLimitExceeded { limit: 2, .. }));
        drop(first);
        drop(_again);
        assert!(store.pin_latest().is_ok());
    }

    #[test]
    fn observers_see_commits() {
        let store = Store::open_memory(StoreOptions::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = store.add_observer(Arc::new(move |event: &CommitEvent| {
            sink.lock().push((event.version().version, event.changes().created.len()));
        }));
        let mut txn = store.begin_write(CommitOrigin::Sync).unwrap();
        add_items(&mut txn);
        create(&mut txn, 0, 1);
        txn.commit().unwrap();
        store.remove_observer(id);
        store.begin_write(CommitOrigin::Local).unwrap().commit().unwrap();
        assert_eq!(*seen.lock(), vec![(2, 1)]);
    }

    #[test]
    fn file_store_survives_reopen_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.realm");
        {
            let store = Store::open_file(&path, StoreOptions::default()).unwrap();
            for n in 0..3 {
                let mut txn = store.begin_write(CommitOrigin::Local).unwrap();
                if n == 0 {
                    add_items(&mut txn);
                }
                create(&mut txn, n, n * 10);
                txn.commit().unwrap();
            }
            let before = store.log_size().unwrap();
            assert!(store.compact().unwrap());
            assert!(store.log_size().unwrap() < before);
        }
        let store = Store::open_file(&path, StoreOptions::default()).unwrap();
        let snap = store.latest();
        assert_eq!(snap.version.version, 4);
        assert_eq!(snap.table(ClassKey(0)).unwrap().len(), 3);
    }

    #[test]
    fn two_stores_on_one_file_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.realm");
        let a = Store::open_file(&path, StoreOptions::default()).unwrap();
        let b = Store::open_file(&path, StoreOptions::default()).unwrap();
        let mut txn = a.begin_write(CommitOrigin::Local).unwrap();
        add_items(&mut txn);
        txn.commit().unwrap();

        assert!(b.refresh().unwrap());
        assert!(b.latest().class_key("Item").is_some());
        let mut txn = b.begin_write(CommitOrigin::Local).unwrap();
        create(&mut txn, 0, 5);
        txn.commit().unwrap();
        assert!(a.refresh().unwrap());
        assert_eq!(a.latest().version, b.latest().version);
    }

    #[test]
    fn read_only_store_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.realm");
        let err = Store::open_file(
            &path,
            StoreOptions {
                writable: false,
                ..StoreOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::FileAccess { .. }));
    }
}
