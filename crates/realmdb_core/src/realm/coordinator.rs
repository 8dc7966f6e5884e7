//! Per-file coordination shared by every handle in the process.

use crate::error::{CoreError, CoreResult};
use crate::realm::config::RealmConfig;
use crate::realm::RealmInner;
use crate::storage::store::{CommitEvent, Store, StoreOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<Coordinator>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Key under which a realm is registered: the canonical path for files,
/// the literal path for in-memory realms.
pub(crate) fn registry_key(path: &Path, in_memory: bool) -> PathBuf {
    if in_memory {
        let mut key = PathBuf::from("memory:");
        key.push(path);
        return key;
    }
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // The file may not exist yet; canonicalize the directory instead.
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map_or_else(|_| path.to_path_buf(), |dir| dir.join(name)),
        _ => std::env::current_dir().map_or_else(|_| path.to_path_buf(), |dir| dir.join(path)),
    }
}

/// Whether any handle in this process has `path` open.
pub(crate) fn is_open(path: &Path) -> bool {
    let key = registry_key(path, false);
    registry()
        .lock()
        .get(&key)
        .is_some_and(|weak| weak.strong_count() > 0)
}

pub(crate) struct Coordinator {
    key: PathBuf,
    store: Arc<Store>,
    realms: Mutex<Vec<Weak<RealmInner>>>,
    observer: Mutex<Option<u64>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("key", &self.key)
            .field("realms", &self.realms.lock().len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Returns the coordinator for `config`, opening the store on first use.
    ///
    /// The flag reports whether this call opened the store.
    pub fn get_or_open(config: &RealmConfig) -> CoreResult<(Arc<Self>, bool)> {
        let key = registry_key(&config.path, config.in_memory);
        let mut registry = registry().lock();
        if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
            drop(registry);
            if !existing.store.is_writable() && !config.is_read_only() {
                return Err(CoreError::illegal(format!(
                    "'{}' is already open with a different access mode",
                    config.path.display()
                )));
            }
            return Ok((existing, false));
        }

        let options = StoreOptions {
            writable: !config.is_read_only(),
            max_versions: config.max_number_of_active_versions,
            sync_on_commit: config.sync_on_commit,
        };
        let store = if config.in_memory {
            Store::open_memory(options)?
        } else {
            Store::open_file(&config.path, options)?
        };
        let coordinator = Arc::new(Self {
            key: key.clone(),
            store,
            realms: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        });
        let weak = Arc::downgrade(&coordinator);
        let id = coordinator.store.add_observer(Arc::new(move |event: &CommitEvent| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_commit(event);
            }
        }));
        *coordinator.observer.lock() = Some(id);
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(key, Arc::downgrade(&coordinator));
        tracing::debug!(target: "realm", path = %config.path.display(), "opened coordinator");
        Ok((coordinator, true))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn register(&self, realm: &Arc<RealmInner>) {
        let mut realms = self.realms.lock();
        realms.retain(|r| r.strong_count() > 0);
        realms.push(Arc::downgrade(realm));
    }

    pub fn unregister(&self, realm: &RealmInner) {
        self.realms
            .lock()
            .retain(|r| r.strong_count() > 0 && !std::ptr::eq(r.as_ptr(), realm));
    }

    /// Live handles, for cache lookups.
    pub fn live_realms(&self) -> Vec<Arc<RealmInner>> {
        self.realms.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn on_commit(&self, event: &CommitEvent) {
        tracing::trace!(
            target: "realm.storage.notification",
            version = %event.version(),
            "scheduling notifications"
        );
        for realm in self.live_realms() {
            realm.schedule_notify();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(id) = self.observer.lock().take() {
            self.store.remove_observer(id);
        }
        let mut registry = registry().lock();
        if registry
            .get(&self.key)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            registry.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_realms_share_a_store() {
        let config = RealmConfig::in_memory("coordinator-shared");
        let (a, opened_a) = Coordinator::get_or_open(&config).unwrap();
        let (b, opened_b) = Coordinator::get_or_open(&config).unwrap();
        assert!(opened_a);
        assert!(!opened_b);
        assert!(Arc::ptr_eq(a.store(), b.store()));
    }

    #[test]
    fn file_registration_tracks_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracked.realm");
        let (coordinator, _) = Coordinator::get_or_open(&RealmConfig::new(&path)).unwrap();
        assert!(is_open(&path));
        drop(coordinator);
        assert!(!is_open(&path));
    }

    #[test]
    fn registry_key_is_stable_before_and_after_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.realm");
        let before = registry_key(&path, false);
        std::fs::write(&path, b"").unwrap();
        assert_eq!(before, registry_key(&path, false));
    }
}
