//! Per-listener change tracking.
//!
//! Each notifier remembers the last version it reported and the state it saw
//! there. When the realm advances it diffs against that state, so several
//! commits processed together produce one cumulative change set.

use crate::error::CoreResult;
use crate::notify::changes::{CollectionChangeSet, DictionaryChangeSet, ObjectChangeSet};
use crate::notify::diff::{changed_properties, diff_entries, diff_rows, row_changed, Row};
use crate::notify::KeyPathArray;
use crate::storage::snapshot::SnapshotData;
use crate::types::ObjLink;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type Callback<C> = Box<dyn FnMut(&C) + Send>;
pub(crate) type RowSource = Box<dyn Fn(&SnapshotData) -> CoreResult<Vec<Row>> + Send + Sync>;
pub(crate) type EntrySource =
    Box<dyn Fn(&SnapshotData) -> CoreResult<BTreeMap<String, Row>> + Send + Sync>;

/// A registered listener.
pub(crate) trait Notifier: Send + Sync {
    fn id(&self) -> u64;

    /// Reports changes between the last delivered version and `snapshot`.
    fn deliver(&self, snapshot: &Arc<SnapshotData>);

    /// Whether a final notification was sent and nothing more will follow.
    fn is_finished(&self) -> bool;
}

pub(crate) struct ObjectNotifier {
    id: u64,
    link: ObjLink,
    filter: Option<KeyPathArray>,
    finished: AtomicBool,
    state: Mutex<(Arc<SnapshotData>, Callback<ObjectChangeSet>)>,
}

impl ObjectNotifier {
    pub fn new(
        id: u64,
        link: ObjLink,
        filter: Option<KeyPathArray>,
        base: Arc<SnapshotData>,
        callback: Callback<ObjectChangeSet>,
    ) -> Self {
        Self {
            id,
            link,
            filter,
            finished: AtomicBool::new(false),
            state: Mutex::new((base, callback)),
        }
    }
}

impl Notifier for ObjectNotifier {
    fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, snapshot: &Arc<SnapshotData>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.state.lock();
        let (last, callback) = &mut *state;
        if Arc::ptr_eq(last, snapshot) {
            return;
        }
        let changes = if snapshot.object_exists(self.link) {
            ObjectChangeSet {
                is_deleted: false,
                modified_properties: changed_properties(
                    last,
                    snapshot,
                    self.link.class,
                    self.link.key,
                    self.filter.as_ref(),
                ),
            }
        } else {
            self.finished.store(true, Ordering::Release);
            ObjectChangeSet {
                is_deleted: true,
                modified_properties: Vec::new(),
            }
        };
        *last = Arc::clone(snapshot);
        if !changes.is_empty() {
            callback(&changes);
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

struct CollectionState {
    last: Arc<SnapshotData>,
    rows: Vec<Row>,
    callback: Callback<CollectionChangeSet>,
}

/// Observes lists, sets and results: anything that evaluates to rows.
pub(crate) struct CollectionNotifier {
    id: u64,
    source: RowSource,
    filter: Option<KeyPathArray>,
    finished: AtomicBool,
    state: Mutex<CollectionState>,
}

impl CollectionNotifier {
    pub fn new(
        id: u64,
        source: RowSource,
        filter: Option<KeyPathArray>,
        base: Arc<SnapshotData>,
        callback: Callback<CollectionChangeSet>,
    ) -> CoreResult<Self> {
        let rows = source(&base)?;
        Ok(Self {
            id,
            source,
            filter,
            finished: AtomicBool::new(false),
            state: Mutex::new(CollectionState {
                last: base,
                rows,
                callback,
            }),
        })
    }
}

impl Notifier for CollectionNotifier {
    fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, snapshot: &Arc<SnapshotData>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.state.lock();
        if Arc::ptr_eq(&state.last, snapshot) {
            return;
        }
        let changes = match (self.source)(snapshot) {
            Ok(rows) => {
                let old = &state.last;
                let filter = self.filter.as_ref();
                let changes = diff_rows(&state.rows, &rows, |a, b| {
                    row_changed(old, snapshot, a, b, filter)
                });
                state.rows = rows;
                changes
            }
            Err(err) => {
                tracing::debug!(
                    target: "realm.storage.notification",
                    error = %err,
                    "observed collection is gone"
                );
                self.finished.store(true, Ordering::Release);
                let mut changes = CollectionChangeSet::default();
                for i in 0..state.rows.len() {
                    changes.deletions.add(i);
                }
                changes.root_was_deleted = true;
                state.rows.clear();
                changes
            }
        };
        state.last = Arc::clone(snapshot);
        if !changes.is_empty() {
            (state.callback)(&changes);
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

struct DictionaryState {
    last: Arc<SnapshotData>,
    entries: BTreeMap<String, Row>,
    callback: Callback<DictionaryChangeSet>,
}

pub(crate) struct DictionaryNotifier {
    id: u64,
    source: EntrySource,
    filter: Option<KeyPathArray>,
    finished: AtomicBool,
    state: Mutex<DictionaryState>,
}

impl DictionaryNotifier {
    pub fn new(
        id: u64,
        source: EntrySource,
        filter: Option<KeyPathArray>,
        base: Arc<SnapshotData>,
        callback: Callback<DictionaryChangeSet>,
    ) -> CoreResult<Self> {
        let entries = source(&base)?;
        Ok(Self {
            id,
            source,
            filter,
            finished: AtomicBool::new(false),
            state: Mutex::new(DictionaryState {
                last: base,
                entries,
                callback,
            }),
        })
    }
}

impl Notifier for DictionaryNotifier {
    fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, snapshot: &Arc<SnapshotData>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.state.lock();
        if Arc::ptr_eq(&state.last, snapshot) {
            return;
        }
        let changes = match (self.source)(snapshot) {
            Ok(entries) => {
                let old = &state.last;
                let filter = self.filter.as_ref();
                let changes = diff_entries(&state.entries, &entries, |a, b| {
                    row_changed(old, snapshot, a, b, filter)
                });
                state.entries = entries;
                changes
            }
            Err(_) => {
                self.finished.store(true, Ordering::Release);
                let changes = DictionaryChangeSet {
                    deletions: state.entries.keys().cloned().collect(),
                    root_was_deleted: true,
                    ..DictionaryChangeSet::default()
                };
                state.entries.clear();
                changes
            }
        };
        state.last = Arc::clone(snapshot);
        if !changes.is_empty() {
            (state.callback)(&changes);
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
