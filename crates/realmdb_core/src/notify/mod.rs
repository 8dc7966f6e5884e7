//! Change notifications.
//!
//! Listeners are registered on objects, collections and results and receive
//! change sets on the owning realm's [`Scheduler`]. A listener stays
//! registered for as long as its [`NotificationToken`] is alive.

pub(crate) mod changes;
pub(crate) mod diff;
pub(crate) mod notifier;
pub(crate) mod scheduler;

pub use changes::{CollectionChangeSet, DictionaryChangeSet, IndexSet, Move, ObjectChangeSet};
pub use scheduler::{FrozenScheduler, ManualScheduler, Scheduler, WorkQueue};

use crate::realm::RealmInner;
use crate::types::{ClassKey, PropertyKey};
use std::fmt;
use std::sync::Weak;

/// Property paths a listener cares about.
///
/// Each path starts at the observed class and may follow links. Changes
/// outside every path are not reported as modifications. An empty array
/// reports only insertions and deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPathArray {
    paths: Vec<Vec<(ClassKey, PropertyKey)>>,
}

impl KeyPathArray {
    pub(crate) fn new(paths: Vec<Vec<(ClassKey, PropertyKey)>>) -> Self {
        Self { paths }
    }

    /// Number of paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether there are no paths.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &[(ClassKey, PropertyKey)]> {
        self.paths.iter().map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    Notifier(u64),
    Callback(u64),
}

/// Keeps a listener registered. Dropping it unregisters the listener.
#[must_use = "the listener is removed when the token is dropped"]
pub struct NotificationToken {
    realm: Weak<RealmInner>,
    registration: Registration,
}

impl NotificationToken {
    pub(crate) fn new(realm: Weak<RealmInner>, registration: Registration) -> Self {
        Self {
            realm,
            registration,
        }
    }
}

impl fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NotificationToken")
            .field(&self.registration)
            .finish()
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        if let Some(realm) = self.realm.upgrade() {
            realm.unregister(self.registration);
        }
    }
}
