//! Explicit sharing of realm handles.

use crate::error::CoreResult;
use crate::realm::config::RealmConfig;
use crate::realm::coordinator::registry_key;
use crate::realm::{Realm, RealmInner};
use crate::notify::{ManualScheduler, Scheduler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Hands out shared handles per (file, schema version, scheduler).
///
/// Entries hold weak references: a handle stays cached while someone uses
/// it and is reopened once every user dropped it.
#[derive(Default)]
pub struct RealmCache {
    entries: Mutex<HashMap<(PathBuf, u64), Vec<Weak<RealmInner>>>>,
}

impl std::fmt::Debug for RealmCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl RealmCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `config` on its scheduler, opening one
    /// when none is alive.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Realm::open`].
    pub fn get_or_open(&self, mut config: RealmConfig) -> CoreResult<Realm> {
        let scheduler: Arc<dyn Scheduler> = match &config.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => Arc::new(ManualScheduler::new()),
        };
        let key = (
            registry_key(&config.path, config.in_memory),
            config.schema_version,
        );
        {
            let mut entries = self.entries.lock();
            let slot = entries.entry(key.clone()).or_default();
            slot.retain(|weak| weak.upgrade().is_some_and(|inner| !inner.is_closed()));
            let found = slot
                .iter()
                .filter_map(Weak::upgrade)
                .find(|inner| inner.scheduler().is_same_as(scheduler.as_ref()));
            if let Some(inner) = found {
                return Ok(Realm { inner });
            }
        }
        // The lock is not held across open: migrations run user code.
        config.scheduler = Some(scheduler);
        let realm = Realm::open(config)?;
        self.entries
            .lock()
            .entry(key)
            .or_default()
            .push(Arc::downgrade(&realm.inner));
        Ok(realm)
    }

    /// Number of live cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no cached handle is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every cached handle. Open handles stay usable.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_scheduler_shares_a_handle() {
        let cache = RealmCache::new();
        let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
        let config = RealmConfig::in_memory("cache-shared").scheduler(Arc::clone(&scheduler));
        let a = cache.get_or_open(config.clone()).unwrap();
        let b = cache.get_or_open(config).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(cache.len(), 1);

        let other = RealmConfig::in_memory("cache-shared").scheduler(Arc::new(ManualScheduler::new()));
        let c = cache.get_or_open(other).unwrap();
        assert!(!a.ptr_eq(&c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn closed_handles_are_not_reused() {
        let cache = RealmCache::new();
        let config = RealmConfig::in_memory("cache-closed").scheduler(Arc::new(ManualScheduler::new()));
        let a = cache.get_or_open(config.clone()).unwrap();
        a.close().unwrap();
        let b = cache.get_or_open(config).unwrap();
        assert!(!a.ptr_eq(&b));
        assert!(!b.is_closed());
    }
}
