//! Flexible sync subscriptions.
//!
//! A subscription set is an immutable, versioned list of queries. Changing
//! it means making a mutable copy, editing it and committing, which
//! creates the next version in the [`SubscriptionSetState::Pending`]
//! state. The session sends it to the server, and the set moves through
//! bootstrapping until the server data it selects is in the realm. The
//! newest complete set is the active one; completing a set supersedes
//! every older one.

use crate::client::deliver;
use crate::error::{SyncError, SyncResult};
use crate::history::sidecar;
use parking_lot::{Condvar, Mutex};
use realmdb_codec::{from_cbor, to_cbor, FrameReader, FrameWriter};
use realmdb_core::{ObjectId, Results, Scheduler, Timestamp};
use realmdb_sync_protocol::QuerySpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAGIC: [u8; 4] = *b"RSUB";
const FORMAT_VERSION: u16 = 1;
const KIND_SETS: u8 = 1;

/// Where a subscription set is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionSetState {
    /// Being edited; not committed yet.
    Uncommitted,
    /// Committed, not yet acknowledged by the server.
    Pending,
    /// The server is sending the data the set selects.
    Bootstrapping,
    /// Bootstrap applied; waiting for the server to confirm nothing else
    /// is in flight.
    AwaitingMark,
    /// The set is active.
    Complete,
    /// The server rejected the set.
    Error,
    /// A newer set completed first.
    Superseded,
}

impl SubscriptionSetState {
    fn rank(self) -> u8 {
        match self {
            Self::Uncommitted => 0,
            Self::Pending => 1,
            Self::Bootstrapping => 2,
            Self::AwaitingMark => 3,
            Self::Complete | Self::Error | Self::Superseded => 4,
        }
    }
}

impl fmt::Display for SubscriptionSetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One query of a subscription set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier.
    pub id: ObjectId,
    /// Optional name; names are unique within a set.
    pub name: Option<String>,
    /// Class the query runs against.
    pub object_class_name: String,
    /// Query text.
    pub query_string: String,
    /// When the subscription was created.
    pub created_at: Timestamp,
    /// When the subscription was last changed.
    pub updated_at: Timestamp,
}

impl Subscription {
    fn new(name: Option<&str>, class: &str, query: &str) -> Self {
        let now = Timestamp::now();
        Self {
            id: ObjectId::generate(),
            name: name.map(str::to_owned),
            object_class_name: class.to_owned(),
            query_string: query.to_owned(),
            created_at: now,
            updated_at: now,
        }
    }

    fn matches_query(&self, class: &str, query: &str) -> bool {
        self.object_class_name == class && self.query_string == query
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SetRecord {
    pub version: u64,
    pub state: SubscriptionSetState,
    pub error: Option<String>,
    pub subscriptions: Vec<Subscription>,
}

impl SetRecord {
    fn initial() -> Self {
        Self {
            version: 0,
            state: SubscriptionSetState::Complete,
            error: None,
            subscriptions: Vec::new(),
        }
    }

    fn superseded(version: u64) -> Self {
        Self {
            version,
            state: SubscriptionSetState::Superseded,
            error: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn queries(&self) -> Vec<QuerySpec> {
        self.subscriptions
            .iter()
            .map(|s| QuerySpec {
                class: s.object_class_name.clone(),
                query: s.query_string.clone(),
            })
            .collect()
    }
}

type StateCallback = Box<dyn FnOnce(SyncResult<SubscriptionSetState>) + Send>;
type CommitHook = Arc<dyn Fn(u64) + Send + Sync>;

struct Waiter {
    version: u64,
    target: SubscriptionSetState,
    callback: StateCallback,
}

#[derive(Default)]
struct StoreState {
    sets: BTreeMap<u64, SetRecord>,
    waiters: Vec<Waiter>,
}

impl StoreState {
    fn record(&self, version: u64) -> SetRecord {
        self.sets
            .get(&version)
            .cloned()
            .unwrap_or_else(|| SetRecord::superseded(version))
    }

    fn latest_version(&self) -> u64 {
        self.sets.keys().next_back().copied().unwrap_or(0)
    }

    fn active_version(&self) -> u64 {
        self.sets
            .values()
            .rev()
            .find(|r| r.state == SubscriptionSetState::Complete)
            .map_or(0, |r| r.version)
    }
}

/// Outcome of waiting for `target` on a set now in `record`'s state, or
/// `None` to keep waiting.
fn outcome(record: &SetRecord, target: SubscriptionSetState) -> Option<SyncResult<SubscriptionSetState>> {
    match record.state {
        SubscriptionSetState::Error => Some(Err(SyncError::SubscriptionFailed(
            record.error.clone().unwrap_or_default(),
        ))),
        SubscriptionSetState::Superseded => Some(Ok(SubscriptionSetState::Superseded)),
        state if state.rank() >= target.rank() => Some(Ok(state)),
        _ => None,
    }
}

/// Every subscription set of one realm, kept in `<realm>.subscriptions`.
pub(crate) struct SubscriptionStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    changed: Condvar,
    on_commit: Mutex<Option<CommitHook>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl SubscriptionStore {
    pub fn load(realm_path: &Path, in_memory: bool, scheduler: Option<Arc<dyn Scheduler>>) -> SyncResult<Arc<Self>> {
        let path = (!in_memory).then(|| sidecar(realm_path, "subscriptions"));
        let mut sets = BTreeMap::new();
        if let Some(path) = &path {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let frame = FrameReader::new(MAGIC, FORMAT_VERSION).decode_one(&bytes)?;
                    let records: Vec<SetRecord> = from_cbor(&frame.payload)?;
                    sets.extend(records.into_iter().map(|r| (r.version, r)));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if sets.is_empty() {
            sets.insert(0, SetRecord::initial());
        }
        Ok(Arc::new(Self {
            path,
            state: Mutex::new(StoreState {
                sets,
                waiters: Vec::new(),
            }),
            changed: Condvar::new(),
            on_commit: Mutex::new(None),
            scheduler,
        }))
    }

    fn save(&self, state: &StoreState) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records: Vec<&SetRecord> = state.sets.values().collect();
        let frame = FrameWriter::new(MAGIC, FORMAT_VERSION).encode(KIND_SETS, &to_cbor(&records)?)?;
        let tmp = sidecar(path, "tmp");
        std::fs::write(&tmp, frame)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn set_on_commit(&self, hook: Option<CommitHook>) {
        *self.on_commit.lock() = hook;
    }

    pub fn latest(self: &Arc<Self>) -> SubscriptionSet {
        let record = {
            let state = self.state.lock();
            state.record(state.latest_version())
        };
        SubscriptionSet::new(Arc::clone(self), record)
    }

    pub fn active(self: &Arc<Self>) -> SubscriptionSet {
        let record = {
            let state = self.state.lock();
            state.record(state.active_version())
        };
        SubscriptionSet::new(Arc::clone(self), record)
    }

    pub fn record(&self, version: u64) -> SetRecord {
        self.state.lock().record(version)
    }

    /// The newest set, when it still has to be sent to the server.
    pub fn pending_after(&self, version: u64) -> Option<SetRecord> {
        let state = self.state.lock();
        let latest = state.sets.values().next_back()?;
        (latest.version > version && latest.state == SubscriptionSetState::Pending).then(|| latest.clone())
    }

    fn commit(&self, subscriptions: Vec<Subscription>) -> SyncResult<SetRecord> {
        let record = {
            let mut state = self.state.lock();
            let record = SetRecord {
                version: state.latest_version() + 1,
                state: SubscriptionSetState::Pending,
                error: None,
                subscriptions,
            };
            state.sets.insert(record.version, record.clone());
            if let Err(err) = self.save(&state) {
                state.sets.remove(&record.version);
                return Err(err);
            }
            record
        };
        tracing::debug!(
            target: "realm.sync.client.session",
            version = record.version,
            queries = record.subscriptions.len(),
            "committed subscription set"
        );
        let hook = self.on_commit.lock().clone();
        if let Some(hook) = hook {
            hook(record.version);
        }
        Ok(record)
    }

    /// Moves set `version` to `new_state`. Completing a set supersedes
    /// every older one.
    pub fn set_state(&self, version: u64, new_state: SubscriptionSetState, error: Option<String>) {
        let ready = {
            let mut state = self.state.lock();
            let Some(record) = state.sets.get_mut(&version) else {
                return;
            };
            if record.state == new_state || record.state.rank() == 4 && new_state != SubscriptionSetState::Error {
                return;
            }
            record.state = new_state;
            record.error = error;
            if new_state == SubscriptionSetState::Complete {
                state.sets.retain(|v, _| *v >= version);
            }
            if let Err(err) = self.save(&state) {
                tracing::warn!(target: "realm.sync.client.session", error = %err, "failed to save subscriptions");
            }
            let waiters = std::mem::take(&mut state.waiters);
            let mut ready = Vec::new();
            for waiter in waiters {
                match outcome(&state.record(waiter.version), waiter.target) {
                    Some(result) => ready.push((waiter.callback, result)),
                    None => state.waiters.push(waiter),
                }
            }
            ready
        };
        tracing::debug!(target: "realm.sync.client.session", version, state = %new_state, "subscription set state changed");
        self.changed.notify_all();
        for (callback, result) in ready {
            deliver(self.scheduler.as_ref(), move || callback(result));
        }
    }

    /// Puts sets that were being bootstrapped back to pending, so they are
    /// sent again on the next connection.
    pub fn revert_in_flight(&self) {
        let mut state = self.state.lock();
        for record in state.sets.values_mut() {
            if matches!(
                record.state,
                SubscriptionSetState::Bootstrapping | SubscriptionSetState::AwaitingMark
            ) {
                record.state = SubscriptionSetState::Pending;
            }
        }
    }

    fn notify_at(&self, version: u64, target: SubscriptionSetState, callback: StateCallback) {
        let result = {
            let mut state = self.state.lock();
            match outcome(&state.record(version), target) {
                Some(result) => result,
                None => {
                    state.waiters.push(Waiter {
                        version,
                        target,
                        callback,
                    });
                    return;
                }
            }
        };
        deliver(self.scheduler.as_ref(), move || callback(result));
    }

    fn wait(&self, version: u64, target: SubscriptionSetState, timeout: Duration) -> SyncResult<SubscriptionSetState> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(result) = outcome(&state.record(version), target) {
                return result;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return outcome(&state.record(version), target).unwrap_or(Err(SyncError::Timeout));
            }
        }
    }

    /// Fails every waiter, as when the session stops for good.
    pub fn fail_waiters(&self, message: &str) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        for waiter in waiters {
            let error = SyncError::SubscriptionFailed(message.to_owned());
            deliver(self.scheduler.as_ref(), move || (waiter.callback)(Err(error)));
        }
    }

    pub fn delete_file(realm_path: &Path) -> SyncResult<bool> {
        match std::fs::remove_file(sidecar(realm_path, "subscriptions")) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// A committed subscription set.
///
/// The handle is a snapshot; [`SubscriptionSet::refresh`] picks up state
/// changes.
#[derive(Clone)]
pub struct SubscriptionSet {
    store: Arc<SubscriptionStore>,
    record: SetRecord,
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("version", &self.record.version)
            .field("state", &self.record.state)
            .field("subscriptions", &self.record.subscriptions)
            .finish()
    }
}

impl SubscriptionSet {
    fn new(store: Arc<SubscriptionStore>, record: SetRecord) -> Self {
        Self { store, record }
    }

    /// Version; 0 is the empty set every realm starts with.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    /// State when the handle was created or last refreshed.
    pub fn state(&self) -> SubscriptionSetState {
        self.record.state
    }

    /// Why the server rejected the set.
    pub fn error_str(&self) -> Option<&str> {
        self.record.error.as_deref()
    }

    /// Number of subscriptions.
    pub fn size(&self) -> usize {
        self.record.subscriptions.len()
    }

    /// Whether the set has no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.record.subscriptions.is_empty()
    }

    /// The subscription at `index`.
    pub fn at(&self, index: usize) -> Option<&Subscription> {
        self.record.subscriptions.get(index)
    }

    /// Iterates over the subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.record.subscriptions.iter()
    }

    /// The subscription called `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.iter().find(|s| s.name.as_deref() == Some(name))
    }

    /// The first subscription running `query` against `class`.
    pub fn find_by_query(&self, class: &str, query: &str) -> Option<&Subscription> {
        self.iter().find(|s| s.matches_query(class, query))
    }

    /// The first subscription for the query behind `results`.
    ///
    /// # Errors
    ///
    /// Fails when `results` is not backed by a class query.
    pub fn find_by_results(&self, results: &Results) -> SyncResult<Option<&Subscription>> {
        let (class, query) = describe(results)?;
        Ok(self.find_by_query(&class, &query))
    }

    /// Reloads the state from the store.
    pub fn refresh(&mut self) {
        self.record = self.store.record(self.record.version);
    }

    /// Calls `callback` once the set reaches `target`, is superseded, or
    /// fails.
    pub fn get_state_change_notification(
        &self,
        target: SubscriptionSetState,
        callback: impl FnOnce(SyncResult<SubscriptionSetState>) + Send + 'static,
    ) {
        self.store.notify_at(self.record.version, target, Box::new(callback));
    }

    /// Blocks until the set reaches `target`, is superseded, or fails.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SubscriptionFailed`] when the server rejects the
    /// set and [`SyncError::Timeout`] when `timeout` passes first.
    pub fn wait_for_state(&self, target: SubscriptionSetState, timeout: Duration) -> SyncResult<SubscriptionSetState> {
        self.store.wait(self.record.version, target, timeout)
    }

    /// A mutable copy to edit and commit as the next version.
    pub fn make_mutable_copy(&self) -> MutableSubscriptionSet {
        MutableSubscriptionSet {
            store: Arc::clone(&self.store),
            base_version: self.record.version,
            subscriptions: self.record.subscriptions.clone(),
        }
    }

    pub(crate) fn queries(&self) -> Vec<QuerySpec> {
        self.record.queries()
    }
}

fn describe(results: &Results) -> SyncResult<(String, String)> {
    let class = results
        .class_name()?
        .ok_or_else(|| SyncError::wrong_state("only results of a class query can be subscribed to"))?;
    Ok((class, results.get_query()?.get_description()))
}

/// An editable copy of a subscription set.
pub struct MutableSubscriptionSet {
    store: Arc<SubscriptionStore>,
    base_version: u64,
    subscriptions: Vec<Subscription>,
}

impl fmt::Debug for MutableSubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableSubscriptionSet")
            .field("base_version", &self.base_version)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl MutableSubscriptionSet {
    /// Version this copy was made from.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Always [`SubscriptionSetState::Uncommitted`].
    pub fn state(&self) -> SubscriptionSetState {
        SubscriptionSetState::Uncommitted
    }

    /// Number of subscriptions.
    pub fn size(&self) -> usize {
        self.subscriptions.len()
    }

    /// The subscription at `index`.
    pub fn at(&self, index: usize) -> Option<&Subscription> {
        self.subscriptions.get(index)
    }

    /// Iterates over the subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// The subscription called `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.iter().find(|s| s.name.as_deref() == Some(name))
    }

    /// The first subscription running `query` against `class`.
    pub fn find_by_query(&self, class: &str, query: &str) -> Option<&Subscription> {
        self.iter().find(|s| s.matches_query(class, query))
    }

    /// Removes every subscription.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    /// Adds a subscription or updates an existing one.
    ///
    /// A named subscription replaces the query of the subscription with the
    /// same name. An unnamed one is only added when no unnamed
    /// subscription runs the same query. Returns the index and whether a
    /// subscription was added.
    pub fn insert_or_assign_query(&mut self, name: Option<&str>, class: &str, query: &str) -> (usize, bool) {
        let existing = self.subscriptions.iter().position(|s| match name {
            Some(name) => s.name.as_deref() == Some(name),
            None => s.name.is_none() && s.matches_query(class, query),
        });
        match existing {
            Some(index) => {
                let sub = &mut self.subscriptions[index];
                if !sub.matches_query(class, query) {
                    sub.object_class_name = class.to_owned();
                    sub.query_string = query.to_owned();
                    sub.updated_at = Timestamp::now();
                }
                (index, false)
            }
            None => {
                self.subscriptions.push(Subscription::new(name, class, query));
                (self.subscriptions.len() - 1, true)
            }
        }
    }

    /// Like [`MutableSubscriptionSet::insert_or_assign_query`] with the
    /// query behind `results`.
    ///
    /// # Errors
    ///
    /// Fails when `results` is not backed by a class query.
    pub fn insert_or_assign_results(&mut self, name: Option<&str>, results: &Results) -> SyncResult<(usize, bool)> {
        let (class, query) = describe(results)?;
        Ok(self.insert_or_assign_query(name, &class, &query))
    }

    /// Removes the subscription at `index`.
    pub fn erase_at(&mut self, index: usize) -> Option<Subscription> {
        (index < self.subscriptions.len()).then(|| self.subscriptions.remove(index))
    }

    /// Removes the subscription with `id`.
    pub fn erase_by_id(&mut self, id: ObjectId) -> bool {
        self.erase_where(|s| s.id == id, false)
    }

    /// Removes the subscription called `name`.
    pub fn erase_by_name(&mut self, name: &str) -> bool {
        self.erase_where(|s| s.name.as_deref() == Some(name), false)
    }

    /// Removes the first subscription running `query` against `class`.
    pub fn erase_by_query(&mut self, class: &str, query: &str) -> bool {
        self.erase_where(|s| s.matches_query(class, query), false)
    }

    /// Removes the first subscription for the query behind `results`.
    ///
    /// # Errors
    ///
    /// Fails when `results` is not backed by a class query.
    pub fn erase_by_results(&mut self, results: &Results) -> SyncResult<bool> {
        let (class, query) = describe(results)?;
        Ok(self.erase_by_query(&class, &query))
    }

    /// Removes every subscription on `class`.
    pub fn erase_by_class_name(&mut self, class: &str) -> bool {
        self.erase_where(|s| s.object_class_name == class, true)
    }

    fn erase_where(&mut self, matches: impl Fn(&Subscription) -> bool, all: bool) -> bool {
        let before = self.subscriptions.len();
        if all {
            self.subscriptions.retain(|s| !matches(s));
        } else if let Some(index) = self.subscriptions.iter().position(matches) {
            self.subscriptions.remove(index);
        }
        self.subscriptions.len() != before
    }

    /// Commits the copy as the next version.
    ///
    /// # Errors
    ///
    /// Fails when the set cannot be written to disk.
    pub fn commit(self) -> SyncResult<SubscriptionSet> {
        let record = self.store.commit(self.subscriptions)?;
        Ok(SubscriptionSet::new(self.store, record))
    }
}
