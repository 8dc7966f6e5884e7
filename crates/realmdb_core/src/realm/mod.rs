//! Realm handles: the entry point for reading and writing a realm file.
//!
//! A live [`Realm`] is confined to the scheduler it was opened on. It reads
//! from one pinned version until it is refreshed, either explicitly or by
//! the work its scheduler runs after another handle commits. Frozen realms
//! are pinned forever and may be used from any thread.

pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod convert;
pub(crate) mod coordinator;
pub(crate) mod migration;

pub use cache::RealmCache;
pub use config::{
    InitializationFunction, MigrationFunction, RealmConfig, SchemaMode, ShouldCompactFunction,
    SyncMarker,
};
pub use migration::MigrationContext;

use crate::error::{CoreError, CoreResult};
use crate::notify::notifier::Notifier;
use crate::notify::{
    FrozenScheduler, KeyPathArray, ManualScheduler, NotificationToken, Registration, Scheduler,
    WorkQueue,
};
use crate::schema::{ObjectSchema, Property, PropertyType, Schema, ValidationMode};
use crate::storage::lock::sibling;
use crate::storage::log::{CommitOrigin, LogReport};
use crate::storage::snapshot::SnapshotData;
use crate::storage::store::{describe_file, CommitEvent, PinnedSnapshot, Store, WriteTxn};
use crate::types::{ClassKey, VersionId};
use coordinator::Coordinator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_REALM: AtomicU64 = AtomicU64::new(1);

type ChangedCallback = Arc<dyn Fn(&Realm) + Send + Sync>;
type RefreshCallback = Box<dyn FnOnce(&Realm) + Send>;
type SchemaCallback = Arc<dyn Fn(&Schema) + Send + Sync>;

/// Identifies a pending asynchronous write or commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandle(u32);

enum AsyncOp {
    BeginWrite(Arc<AtomicBool>),
    Commit(Arc<Mutex<Option<WriteTxn>>>),
}

#[derive(Default)]
struct Callbacks {
    changed: Vec<(u64, ChangedCallback)>,
    refresh: Vec<(u64, VersionId, RefreshCallback)>,
    schema: Vec<(u64, SchemaCallback)>,
}

struct RealmState {
    read: Option<PinnedSnapshot>,
    write: Option<WriteTxn>,
    closed: bool,
}

pub(crate) struct RealmInner {
    id: u64,
    this: Weak<RealmInner>,
    config: RealmConfig,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<dyn Scheduler>,
    frozen: bool,
    state: Mutex<RealmState>,
    notifiers: Mutex<Vec<Arc<dyn Notifier>>>,
    callbacks: Mutex<Callbacks>,
    next_registration: AtomicU64,
    work_pending: AtomicBool,
    delivering: AtomicBool,
    async_ops: Mutex<HashMap<u32, AsyncOp>>,
    next_async: AtomicU32,
    last_schema: Mutex<Arc<Schema>>,
}

impl RealmInner {
    fn new(
        config: RealmConfig,
        coordinator: Arc<Coordinator>,
        scheduler: Arc<dyn Scheduler>,
        frozen: Option<PinnedSnapshot>,
    ) -> Arc<Self> {
        let schema = match &frozen {
            Some(pin) => Arc::clone(&pin.data().schema),
            None => Arc::clone(&coordinator.store().latest().schema),
        };
        Arc::new_cyclic(|this| Self {
            id: NEXT_REALM.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            config,
            coordinator,
            scheduler,
            frozen: frozen.is_some(),
            state: Mutex::new(RealmState {
                read: frozen,
                write: None,
                closed: false,
            }),
            notifiers: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Callbacks::default()),
            next_registration: AtomicU64::new(1),
            work_pending: AtomicBool::new(false),
            delivering: AtomicBool::new(false),
            async_ops: Mutex::new(HashMap::new()),
            next_async: AtomicU32::new(1),
            last_schema: Mutex::new(schema),
        })
    }

    fn store(&self) -> &Arc<Store> {
        self.coordinator.store()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn config(&self) -> &RealmConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Posts delivery work to the scheduler unless some is already queued.
    pub(crate) fn schedule_notify(&self) {
        if self.frozen
            || !self.config.automatic_change_notifications
            || !self.scheduler.can_deliver_notifications()
        {
            return;
        }
        if self.work_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.this.clone();
        self.scheduler.notify(WorkQueue::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.deliver();
            }
        }));
    }

    /// Moves the read version to the newest commit. Returns the snapshot to
    /// report and whether the version changed.
    fn advance(&self) -> Option<(Arc<SnapshotData>, bool)> {
        let mut state = self.state.lock();
        if state.closed || state.write.is_some() {
            return None;
        }
        let latest = self.store().latest();
        if let Some(pin) = &state.read {
            if pin.version().version >= latest.version.version {
                return Some((Arc::clone(pin.data()), false));
            }
        }
        state.read = None;
        match self.store().pin(Arc::clone(&latest)) {
            Ok(pin) => {
                state.read = Some(pin);
                Some((latest, true))
            }
            Err(err) => {
                tracing::warn!(target: "realm", error = %err, "could not advance read version");
                None
            }
        }
    }

    /// Advances and runs callbacks and notifiers. Returns whether the
    /// version changed.
    fn deliver(&self) -> bool {
        self.work_pending.store(false, Ordering::Release);
        if self.delivering.swap(true, Ordering::AcqRel) {
            return false;
        }
        let advanced = self.deliver_inner();
        self.delivering.store(false, Ordering::Release);
        advanced
    }

    fn deliver_inner(&self) -> bool {
        let Some(inner) = self.this.upgrade() else {
            return false;
        };
        let Some((snapshot, advanced)) = self.advance() else {
            return false;
        };
        let realm = Realm { inner };

        if advanced {
            let changed: Vec<ChangedCallback> = self
                .callbacks
                .lock()
                .changed
                .iter()
                .map(|(_, f)| Arc::clone(f))
                .collect();
            for callback in changed {
                callback(&realm);
            }
        }

        let due: Vec<RefreshCallback> = {
            let mut callbacks = self.callbacks.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut callbacks.refresh)
                .into_iter()
                .partition(|(_, target, _)| target.version <= snapshot.version.version);
            callbacks.refresh = waiting;
            due.into_iter().map(|(_, _, f)| f).collect::<Vec<_>>()
        };
        for callback in due {
            callback(&realm);
        }

        let schema_changed = {
            let mut last = self.last_schema.lock();
            if Arc::ptr_eq(&last, &snapshot.schema) || **last == *snapshot.schema {
                false
            } else {
                *last = Arc::clone(&snapshot.schema);
                true
            }
        };
        if schema_changed {
            let listeners: Vec<SchemaCallback> = self
                .callbacks
                .lock()
                .schema
                .iter()
                .map(|(_, f)| Arc::clone(f))
                .collect();
            for callback in listeners {
                callback(&snapshot.schema);
            }
        }

        let notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.lock().clone();
        for notifier in &notifiers {
            notifier.deliver(&snapshot);
        }
        self.notifiers.lock().retain(|n| !n.is_finished());
        tracing::trace!(
            target: "realm.storage.notification",
            version = %snapshot.version,
            notifiers = notifiers.len(),
            "delivered"
        );
        advanced
    }

    fn next_registration(&self) -> u64 {
        self.next_registration.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn unregister(&self, registration: Registration) {
        match registration {
            Registration::Notifier(id) => self.notifiers.lock().retain(|n| n.id() != id),
            Registration::Callback(id) => {
                let mut callbacks = self.callbacks.lock();
                callbacks.changed.retain(|(i, _)| *i != id);
                callbacks.refresh.retain(|(i, _, _)| *i != id);
                callbacks.schema.retain(|(i, _)| *i != id);
            }
        }
    }
}

impl Drop for RealmInner {
    fn drop(&mut self) {
        self.coordinator.unregister(self);
    }
}

/// A handle on an open realm.
///
/// Clones share the same underlying instance.
#[derive(Clone)]
pub struct Realm {
    pub(crate) inner: Arc<RealmInner>,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.inner.id)
            .field("path", &self.inner.config.path)
            .field("frozen", &self.inner.frozen)
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Opens the realm described by `config`.
    ///
    /// When a schema is declared it is validated and reconciled with the
    /// stored one according to [`RealmConfig::schema_mode`].
    ///
    /// # Errors
    ///
    /// Returns file errors when the file cannot be opened, schema errors
    /// when the declared schema is invalid or incompatible, and any error
    /// raised by the migration or initialization functions.
    pub fn open(config: RealmConfig) -> CoreResult<Self> {
        let scheduler: Arc<dyn Scheduler> = match &config.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => Arc::new(ManualScheduler::new()),
        };
        if let Some(schema) = &config.schema {
            schema.validate(ValidationMode {
                reject_embedded_orphans: false,
                flexible_sync: config.sync.is_some_and(|s| s.flexible),
            })?;
        }
        let (coordinator, opened) = Coordinator::get_or_open(&config)?;

        if config.cache {
            let cached = coordinator.live_realms().into_iter().find(|r| {
                r.config.cache
                    && !r.frozen
                    && !r.is_closed()
                    && r.config.schema_version == config.schema_version
                    && r.scheduler.is_same_as(scheduler.as_ref())
            });
            if let Some(inner) = cached {
                return Ok(Self { inner });
            }
        }

        if opened && !config.in_memory && !config.is_read_only() {
            if let Some(should_compact) = &config.should_compact_on_launch {
                let store = coordinator.store();
                let (total, used) = (store.log_size()?, store.used_size()?);
                if should_compact(total, used) {
                    let compacted = store.compact()?;
                    tracing::info!(target: "realm", total, used, compacted, "compact on launch");
                }
            }
        }

        let inner = RealmInner::new(config, Arc::clone(&coordinator), scheduler, None);
        coordinator.register(&inner);
        let realm = Self { inner };
        if let Some(schema) = realm.inner.config.schema.clone() {
            if let Err(err) = migration::apply_declared_schema(&realm, schema) {
                realm.close_inner();
                return Err(err);
            }
        }
        tracing::debug!(
            target: "realm",
            path = %realm.inner.config.path.display(),
            "opened realm"
        );
        Ok(realm)
    }

    /// The configuration this realm was opened with.
    #[must_use]
    pub fn config(&self) -> &RealmConfig {
        &self.inner.config
    }

    /// The realm's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// The scheduler notifications are delivered on.
    #[must_use]
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    /// Whether both handles share one instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the realm was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether this is a frozen realm.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.frozen
    }

    /// Whether a write transaction is open.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.state.lock().write.is_some()
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        self.inner.store()
    }

    fn check(&self) -> CoreResult<()> {
        if !self.inner.frozen && !self.inner.scheduler.is_on_thread() {
            return Err(CoreError::WrongThread);
        }
        Ok(())
    }

    fn check_mutable(&self) -> CoreResult<()> {
        self.check()?;
        if self.inner.frozen {
            return Err(CoreError::read_only("frozen realms cannot be modified"));
        }
        if self.inner.config.is_read_only() {
            return Err(CoreError::read_only(format!(
                "realm was opened with schema mode {:?}",
                self.inner.config.schema_mode
            )));
        }
        Ok(())
    }

    /// Runs `f` against the data this realm currently sees: the open write
    /// transaction's state, or the pinned read version.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&SnapshotData) -> CoreResult<T>) -> CoreResult<T> {
        self.check()?;
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(CoreError::Closed);
        }
        if let Some(txn) = &state.write {
            return f(txn.snapshot());
        }
        let snapshot = match &state.read {
            Some(pin) => Arc::clone(pin.data()),
            None => {
                let pin = self.store().pin_latest()?;
                let snapshot = Arc::clone(pin.data());
                state.read = Some(pin);
                snapshot
            }
        };
        drop(state);
        f(&snapshot)
    }

    /// Runs `f` inside the open write transaction.
    pub(crate) fn with_txn<T>(&self, f: impl FnOnce(&mut WriteTxn) -> CoreResult<T>) -> CoreResult<T> {
        self.check()?;
        if self.inner.frozen {
            return Err(CoreError::read_only("frozen realms cannot be modified"));
        }
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(CoreError::Closed);
        }
        match state.write.as_mut() {
            Some(txn) => f(txn),
            None => Err(CoreError::NotInWriteTransaction),
        }
    }

    /// The committed version this realm reads from. Listener registration
    /// needs one, so it fails inside a write transaction.
    pub(crate) fn current_snapshot(&self) -> CoreResult<Arc<SnapshotData>> {
        if self.is_writable() {
            return Err(CoreError::wrong_state(
                "cannot register a listener inside a write transaction",
            ));
        }
        self.read(|_| Ok(()))?;
        let state = self.inner.state.lock();
        state
            .read
            .as_ref()
            .map(|pin| Arc::clone(pin.data()))
            .ok_or(CoreError::Closed)
    }

    /// The read version, or `None` inside a write transaction where the data
    /// can change without a version change.
    pub(crate) fn stable_version(&self) -> Option<VersionId> {
        let state = self.inner.state.lock();
        if state.write.is_some() {
            return None;
        }
        state.read.as_ref().map(PinnedSnapshot::version)
    }

    /// Pins the newest version for reading, if nothing is pinned yet.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread, after close, or when the
    /// version limit is reached.
    pub fn begin_read(&self) -> CoreResult<()> {
        self.read(|_| Ok(()))
    }

    /// The version this realm reads from, if a read has begun.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread.
    pub fn version_id(&self) -> CoreResult<Option<VersionId>> {
        self.check()?;
        let state = self.inner.state.lock();
        if state.closed {
            return Err(CoreError::Closed);
        }
        Ok(state.read.as_ref().map(PinnedSnapshot::version))
    }

    /// Number of distinct versions pinned by all handles on this file.
    #[must_use]
    pub fn num_versions(&self) -> usize {
        self.store().num_versions()
    }

    /// The stored schema, including any changes of an open write.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread or after close.
    pub fn schema(&self) -> CoreResult<Arc<Schema>> {
        self.read(|snap| Ok(Arc::clone(&snap.schema)))
    }

    /// The schema version stored in the file, `None` for a new file.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread or after close.
    pub fn schema_version(&self) -> CoreResult<Option<u64>> {
        self.read(|snap| Ok(snap.schema_version))
    }

    /// Looks up a stored class.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread or after close.
    pub fn find_class(&self, name: &str) -> CoreResult<Option<ObjectSchema>> {
        self.read(|snap| Ok(snap.schema.find(name).cloned()))
    }

    /// Keys of every stored class.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread or after close.
    pub fn class_keys(&self) -> CoreResult<Vec<ClassKey>> {
        self.read(|snap| Ok(snap.tables.keys().copied().collect()))
    }

    /// Stored and computed properties of a class.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchClass`] for unknown keys.
    pub fn class_properties(&self, class: ClassKey) -> CoreResult<Vec<Property>> {
        self.read(|snap| Ok(snap.table(class)?.schema.all_properties().cloned().collect()))
    }

    /// Finds a property by internal or public name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchClass`] for unknown keys.
    pub fn find_property(&self, class: ClassKey, name: &str) -> CoreResult<Option<Property>> {
        self.read(|snap| {
            let schema = &snap.table(class)?.schema;
            Ok(schema
                .property_for_name(name)
                .or_else(|| schema.property_for_public_name(name))
                .cloned())
        })
    }

    /// Number of objects in a class.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchClass`] for unknown keys.
    pub fn num_objects(&self, class: ClassKey) -> CoreResult<usize> {
        self.read(|snap| Ok(snap.table(class)?.len()))
    }

    /// Resolves dotted property paths on `class` into a key path filter.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NoSuchClass`] or [`CoreError::NoSuchProperty`]
    /// when a name does not resolve, and [`CoreError::IllegalOperation`] when
    /// a path continues past a non-link property.
    pub fn create_key_path_array(&self, class: &str, paths: &[&str]) -> CoreResult<KeyPathArray> {
        self.read(|snap| {
            let mut out = Vec::with_capacity(paths.len());
            for path in paths {
                let mut current = snap.class_key(class).ok_or_else(|| CoreError::NoSuchClass {
                    name: class.to_owned(),
                })?;
                let mut resolved = Vec::new();
                let mut names = path.split('.').peekable();
                while let Some(name) = names.next() {
                    let schema = &snap.table(current)?.schema;
                    let property = schema
                        .property_for_public_name(name)
                        .or_else(|| schema.property_for_name(name))
                        .filter(|p| p.is_persisted())
                        .ok_or_else(|| CoreError::NoSuchProperty {
                            class: schema.name.clone(),
                            property: name.to_owned(),
                        })?;
                    resolved.push((current, property.key));
                    if names.peek().is_some() {
                        let target = match (property.property_type, &property.link_target) {
                            (PropertyType::Object, Some(target)) => snap.class_key(target),
                            _ => None,
                        };
                        current = target.ok_or_else(|| {
                            CoreError::illegal(format!(
                                "key path '{path}' continues past '{name}', which is not a link"
                            ))
                        })?;
                    }
                }
                out.push(resolved);
            }
            Ok(KeyPathArray::new(out))
        })
    }

    /// Starts a write transaction, waiting for other writers to finish.
    ///
    /// # Errors
    ///
    /// Fails on frozen or read-only realms and when a write is already open.
    pub fn begin_write(&self) -> CoreResult<()> {
        self.begin_write_as(CommitOrigin::Local)
    }

    fn begin_write_as(&self, origin: CommitOrigin) -> CoreResult<()> {
        self.check_mutable()?;
        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(CoreError::Closed);
            }
            if state.write.is_some() {
                return Err(CoreError::wrong_state("the realm is already in a write transaction"));
            }
        }
        let txn = self.store().begin_write(origin)?;
        let mut state = self.inner.state.lock();
        state.read = None;
        state.read = Some(self.store().pin(Arc::clone(txn.base()))?);
        state.write = Some(txn);
        Ok(())
    }

    /// Commits the open write transaction and returns the new version.
    ///
    /// # Errors
    ///
    /// Fails when no write is open or the log cannot be written; the
    /// transaction is rolled back in that case.
    pub fn commit(&self) -> CoreResult<VersionId> {
        self.check()?;
        let txn = self
            .inner
            .state
            .lock()
            .write
            .take()
            .ok_or_else(|| CoreError::wrong_state("not in a write transaction"))?;
        let event = txn.commit()?;
        self.adopt(&event);
        Ok(event.version)
    }

    fn adopt(&self, event: &CommitEvent) {
        let mut state = self.inner.state.lock();
        if state.closed || state.write.is_some() {
            return;
        }
        if state
            .read
            .as_ref()
            .is_some_and(|pin| pin.version().version >= event.version.version)
        {
            return;
        }
        state.read = None;
        match self.store().pin(Arc::clone(&event.snapshot)) {
            Ok(pin) => state.read = Some(pin),
            Err(err) => tracing::warn!(target: "realm", error = %err, "could not pin commit"),
        }
    }

    /// Discards the open write transaction.
    ///
    /// # Errors
    ///
    /// Fails when no write is open.
    pub fn rollback(&self) -> CoreResult<()> {
        self.check()?;
        let txn = self
            .inner
            .state
            .lock()
            .write
            .take()
            .ok_or_else(|| CoreError::wrong_state("not in a write transaction"))?;
        txn.rollback();
        Ok(())
    }

    /// Runs `f` in a write transaction, committing on success and rolling
    /// back on error.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or of beginning or committing.
    pub fn write<T>(&self, f: impl FnOnce(&Self) -> CoreResult<T>) -> CoreResult<T> {
        self.write_as(CommitOrigin::Local, f)
    }

    /// Like [`Realm::write`], tagging the commit with `origin`. Sync uses
    /// this to keep integrated server changes out of the upload queue.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or of beginning or committing.
    pub fn write_as<T>(
        &self,
        origin: CommitOrigin,
        f: impl FnOnce(&Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.begin_write_as(origin)?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.is_writable() {
                    self.rollback()?;
                }
                Err(err)
            }
        }
    }

    /// Advances to the newest version and delivers notifications.
    ///
    /// Returns whether the version changed.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread or when the file cannot be read.
    pub fn refresh(&self) -> CoreResult<bool> {
        self.check()?;
        if self.inner.frozen || self.is_writable() {
            return Ok(false);
        }
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        self.store().refresh()?;
        Ok(self.inner.deliver())
    }

    /// A frozen realm pinned at the version this realm reads.
    ///
    /// # Errors
    ///
    /// Fails inside a write transaction.
    pub fn freeze(&self) -> CoreResult<Self> {
        self.check()?;
        if self.inner.frozen {
            return Ok(self.clone());
        }
        if self.is_writable() {
            return Err(CoreError::wrong_state("cannot freeze inside a write transaction"));
        }
        self.begin_read()?;
        let pin = {
            let state = self.inner.state.lock();
            state.read.as_ref().map(PinnedSnapshot::duplicate)
        }
        .ok_or(CoreError::Closed)?;
        Ok(self.frozen_with(pin))
    }

    /// A frozen realm pinned at the version a commit produced.
    ///
    /// # Errors
    ///
    /// Fails when the version limit is reached.
    pub fn freeze_at(&self, event: &CommitEvent) -> CoreResult<Self> {
        let pin = self.store().pin(Arc::clone(&event.snapshot))?;
        Ok(self.frozen_with(pin))
    }

    fn frozen_with(&self, pin: PinnedSnapshot) -> Self {
        Self {
            inner: RealmInner::new(
                self.inner.config.clone(),
                Arc::clone(&self.inner.coordinator),
                Arc::new(FrozenScheduler),
                Some(pin),
            ),
        }
    }

    /// Closes the realm. Open writes are rolled back and listeners dropped.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread.
    pub fn close(&self) -> CoreResult<()> {
        self.check()?;
        self.close_inner();
        Ok(())
    }

    fn close_inner(&self) {
        let (read, write) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.read.take(), state.write.take())
        };
        if let Some(txn) = write {
            txn.rollback();
        }
        drop(read);
        self.inner.notifiers.lock().clear();
        *self.inner.callbacks.lock() = Callbacks::default();
        self.inner.coordinator.unregister(&self.inner);
        tracing::debug!(target: "realm", path = %self.path().display(), "closed realm");
    }

    /// Calls `f` every time this realm advances to a new version, before
    /// object and collection notifications.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread.
    pub fn add_realm_changed_callback(
        &self,
        f: impl Fn(&Self) + Send + Sync + 'static,
    ) -> CoreResult<NotificationToken> {
        self.check()?;
        let id = self.inner.next_registration();
        self.inner.callbacks.lock().changed.push((id, Arc::new(f)));
        Ok(self.token(Registration::Callback(id)))
    }

    /// Calls `f` once this realm reaches the newest version that exists now.
    ///
    /// Returns `None` without registering when the realm is already there.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread.
    pub fn add_realm_refresh_callback(
        &self,
        f: impl FnOnce(&Self) + Send + 'static,
    ) -> CoreResult<Option<NotificationToken>> {
        self.begin_read()?;
        let target = self.store().latest().version;
        let current = self.version_id()?;
        if current.is_some_and(|v| v.version >= target.version) {
            return Ok(None);
        }
        let id = self.inner.next_registration();
        self.inner
            .callbacks
            .lock()
            .refresh
            .push((id, target, Box::new(f)));
        Ok(Some(self.token(Registration::Callback(id))))
    }

    /// Calls `f` with the new schema whenever it changes.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread.
    pub fn add_schema_changed_callback(
        &self,
        f: impl Fn(&Schema) + Send + Sync + 'static,
    ) -> CoreResult<NotificationToken> {
        self.check()?;
        let id = self.inner.next_registration();
        self.inner.callbacks.lock().schema.push((id, Arc::new(f)));
        Ok(self.token(Registration::Callback(id)))
    }

    pub(crate) fn add_notifier(
        &self,
        build: impl FnOnce(u64, Arc<SnapshotData>) -> CoreResult<Arc<dyn Notifier>>,
    ) -> CoreResult<NotificationToken> {
        self.check()?;
        if self.inner.frozen {
            return Err(CoreError::illegal("frozen realms do not deliver notifications"));
        }
        let base = self.current_snapshot()?;
        let id = self.inner.next_registration();
        let notifier = build(id, base)?;
        self.inner.notifiers.lock().push(notifier);
        Ok(self.token(Registration::Notifier(id)))
    }

    fn token(&self, registration: Registration) -> NotificationToken {
        NotificationToken::new(Arc::downgrade(&self.inner), registration)
    }

    /// Calls `f` after every commit to this file made in this process, on
    /// the committing thread. Dropping the subscription stops the calls.
    pub fn observe_commits(
        &self,
        f: impl Fn(&CommitEvent) + Send + Sync + 'static,
    ) -> CommitSubscription {
        let store = self.store();
        let id = store.add_observer(Arc::new(f));
        CommitSubscription {
            store: Arc::downgrade(store),
            id,
        }
    }

    /// Runs `callback` on the scheduler once the write lock can be taken.
    ///
    /// With `notify_only` the callback only learns that writing is possible;
    /// otherwise a write transaction is open when it runs.
    ///
    /// # Errors
    ///
    /// Fails on frozen or read-only realms.
    pub fn async_begin_write(
        &self,
        callback: impl FnOnce(&Self) + Send + 'static,
        notify_only: bool,
    ) -> CoreResult<AsyncHandle> {
        self.check_mutable()?;
        let id = self.inner.next_async.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner
            .async_ops
            .lock()
            .insert(id, AsyncOp::BeginWrite(Arc::clone(&cancelled)));
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.notify(WorkQueue::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.async_ops.lock().remove(&id);
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            let realm = Self { inner };
            if !notify_only {
                if let Err(err) = realm.begin_write() {
                    tracing::warn!(target: "realm", error = %err, "async write could not begin");
                    return;
                }
            }
            callback(&realm);
        }));
        Ok(AsyncHandle(id))
    }

    /// Commits the open write on a background thread.
    ///
    /// The realm leaves the write immediately; `callback` runs on the
    /// scheduler with the outcome, after which the realm reads the new
    /// version. `allow_grouping` is accepted for compatibility; every async
    /// commit is written on its own.
    ///
    /// # Errors
    ///
    /// Fails when no write is open or the worker thread cannot start.
    pub fn async_commit(
        &self,
        callback: impl FnOnce(CoreResult<VersionId>) + Send + 'static,
        allow_grouping: bool,
    ) -> CoreResult<AsyncHandle> {
        self.check()?;
        let txn = self
            .inner
            .state
            .lock()
            .write
            .take()
            .ok_or_else(|| CoreError::wrong_state("not in a write transaction"))?;
        let id = self.inner.next_async.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(Some(txn)));
        self.inner
            .async_ops
            .lock()
            .insert(id, AsyncOp::Commit(Arc::clone(&slot)));
        tracing::trace!(target: "realm.storage.transaction", id, allow_grouping, "async commit");

        let weak = Arc::downgrade(&self.inner);
        let scheduler = Arc::clone(&self.inner.scheduler);
        std::thread::Builder::new()
            .name("realm-async-commit".into())
            .spawn(move || {
                let Some(txn) = slot.lock().take() else {
                    return;
                };
                let result = txn.commit();
                scheduler.notify(WorkQueue::new(move || {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.async_ops.lock().remove(&id);
                    let realm = Self { inner };
                    callback(result.map(|event| {
                        realm.adopt(&event);
                        event.version
                    }));
                }));
            })?;
        Ok(AsyncHandle(id))
    }

    /// Cancels a pending async operation. Returns false when it already ran
    /// or the commit was already written.
    pub fn async_cancel(&self, handle: AsyncHandle) -> bool {
        let op = self.inner.async_ops.lock().remove(&handle.0);
        match op {
            Some(AsyncOp::BeginWrite(cancelled)) => {
                cancelled.store(true, Ordering::Release);
                true
            }
            Some(AsyncOp::Commit(slot)) => {
                let txn = slot.lock().take();
                txn.map(WriteTxn::rollback).is_some()
            }
            None => false,
        }
    }

    /// Rewrites the file as a single snapshot.
    ///
    /// Returns false when another process has the file open.
    ///
    /// # Errors
    ///
    /// Fails inside a write transaction or while another handle in this
    /// process is writing.
    pub fn compact(&self) -> CoreResult<bool> {
        self.check_mutable()?;
        if self.is_writable() {
            return Err(CoreError::wrong_state("cannot compact inside a write transaction"));
        }
        if self.store().is_write_locked() {
            return Err(CoreError::wrong_state("another write transaction is in progress"));
        }
        let compacted = self.store().compact()?;
        if compacted {
            let mut state = self.inner.state.lock();
            if state.read.is_some() {
                state.read = None;
                state.read = Some(self.store().pin_latest()?);
            }
        }
        Ok(compacted)
    }

    /// The current log size and the size [`Realm::compact`] would leave,
    /// in bytes. These are the arguments `should_compact_on_launch` sees.
    ///
    /// # Errors
    ///
    /// Fails off the realm's thread or when the log cannot be read.
    pub fn compaction_estimate(&self) -> CoreResult<(u64, u64)> {
        self.check()?;
        Ok((self.store().log_size()?, self.store().used_size()?))
    }

    /// Deletes a realm file and its auxiliary files.
    ///
    /// Returns whether the realm file itself existed.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::DeleteOpenedRealm`] while a handle in this
    /// process has the file open.
    pub fn delete_files(path: impl AsRef<Path>) -> CoreResult<bool> {
        let path = path.as_ref();
        if coordinator::is_open(path) {
            return Err(CoreError::DeleteOpenedRealm {
                path: path.to_path_buf(),
            });
        }
        let existed = remove_if_exists(path)?;
        for ext in ["lock", "note"] {
            remove_if_exists(&sibling(path, ext))?;
        }
        let management = sibling(path, "management");
        if management.is_dir() {
            std::fs::remove_dir_all(&management).map_err(|e| CoreError::from_io(&management, &e))?;
        }
        tracing::info!(target: "realm", path = %path.display(), existed, "deleted realm files");
        Ok(existed)
    }

    /// Describes the records of a realm file without opening it.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or not a realm.
    pub fn describe_file(path: impl AsRef<Path>) -> CoreResult<LogReport> {
        describe_file(path.as_ref())
    }
}

fn remove_if_exists(path: &Path) -> CoreResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CoreError::from_io(path, &err)),
    }
}

/// Keeps a commit observer registered.
#[must_use = "the observer is removed when the subscription is dropped"]
pub struct CommitSubscription {
    store: Weak<Store>,
    id: u64,
}

impl fmt::Debug for CommitSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommitSubscription").field(&self.id).finish()
    }
}

impl Drop for CommitSubscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.remove_observer(self.id);
        }
    }
}
