//! Handing live accessors to another thread.
//!
//! Live realms and everything read through them are confined to their
//! scheduler. A [`ThreadSafeReference`] captures what an accessor points at
//! without the realm, and is resolved against a realm opened on the
//! destination thread. Frozen accessors need no reference: they can be
//! shared directly.

use crate::collections::{CollectionRef, Dictionary, List, Set};
use crate::error::{CoreError, CoreResult};
use crate::notify::Scheduler;
use crate::object::Object;
use crate::query::{Results, Source, Stage};
use crate::realm::{Realm, RealmConfig};
use crate::types::{ObjLink, VersionId};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

enum Target {
    Object(ObjLink),
    List(CollectionRef),
    Set(CollectionRef),
    Dictionary(CollectionRef),
    Results { source: Source, stages: Vec<Stage> },
    Realm(Box<RealmConfig>),
}

impl Target {
    fn kind(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Dictionary(_) => "dictionary",
            Self::Results { .. } => "results",
            Self::Realm(_) => "realm",
        }
    }
}

/// A sendable handle to an object, collection, results or realm.
pub struct ThreadSafeReference {
    target: Target,
    path: PathBuf,
    /// Version the accessor was read at; resolving catches up to it.
    version: Option<VersionId>,
}

impl fmt::Debug for ThreadSafeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeReference")
            .field("kind", &self.target.kind())
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

impl ThreadSafeReference {
    fn capture(realm: &Realm, target: Target) -> CoreResult<Self> {
        if realm.is_frozen() {
            return Err(CoreError::illegal(format!(
                "frozen {} can be shared directly",
                target.kind()
            )));
        }
        if realm.is_closed() {
            return Err(CoreError::Closed);
        }
        realm.begin_read()?;
        Ok(Self {
            target,
            path: realm.path().to_path_buf(),
            version: realm.version_id()?,
        })
    }

    /// References `object`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalOperation`] for frozen objects and
    /// [`CoreError::Invalidated`] for deleted ones.
    pub fn from_object(object: &Object) -> CoreResult<Self> {
        if !object.realm().is_frozen() && !object.is_valid() {
            return Err(CoreError::invalidated("object was deleted"));
        }
        Self::capture(object.realm(), Target::Object(object.as_link()))
    }

    /// References `list`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::from_object`].
    pub fn from_list(list: &List) -> CoreResult<Self> {
        Self::capture(list.realm(), Target::List(list.target().clone()))
    }

    /// References `set`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::from_object`].
    pub fn from_set(set: &Set) -> CoreResult<Self> {
        Self::capture(set.realm(), Target::Set(set.target().clone()))
    }

    /// References `dictionary`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::from_object`].
    pub fn from_dictionary(dictionary: &Dictionary) -> CoreResult<Self> {
        Self::capture(
            dictionary.realm(),
            Target::Dictionary(dictionary.target().clone()),
        )
    }

    /// References `results`, keeping their filters and ordering.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalOperation`] for frozen results.
    pub fn from_results(results: &Results) -> CoreResult<Self> {
        Self::capture(
            results.realm(),
            Target::Results {
                source: results.source().clone(),
                stages: results.stages().to_vec(),
            },
        )
    }

    /// References `realm`; resolving opens a new handle on the destination
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalOperation`] for frozen realms.
    pub fn from_realm(realm: &Realm) -> CoreResult<Self> {
        let mut config = realm.config().clone();
        config.scheduler = None;
        Self::capture(realm, Target::Realm(Box::new(config)))
    }

    /// Whether this references an object, list, set, dictionary, results or
    /// realm, as a lowercase word.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.target.kind()
    }

    fn prepare(&self, realm: &Realm) -> CoreResult<()> {
        if realm.path() != self.path || realm.is_frozen() {
            return Err(CoreError::illegal(format!(
                "{} must resolve in a live realm at {}",
                self.target.kind(),
                self.path.display()
            )));
        }
        let Some(version) = self.version else {
            return Ok(());
        };
        realm.begin_read()?;
        if realm.version_id()?.is_some_and(|current| current < version) {
            realm.refresh()?;
        }
        Ok(())
    }

    fn mismatch(&self, wanted: &str) -> CoreError {
        CoreError::illegal(format!(
            "reference holds a {}, not a {wanted}",
            self.target.kind()
        ))
    }

    fn collection(&self, realm: &Realm, target: &CollectionRef) -> CoreResult<()> {
        self.prepare(realm)?;
        realm.read(|snap| target.resolve(snap).map(|_| ()))
    }

    /// Resolves to an object read through `realm`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] when the object was deleted and
    /// [`CoreError::IllegalOperation`] for other kinds of reference or a
    /// realm on another file.
    pub fn resolve_object(self, realm: &Realm) -> CoreResult<Object> {
        let Target::Object(link) = self.target else {
            return Err(self.mismatch("object"));
        };
        self.prepare(realm)?;
        let probe = Object::new(realm.clone(), link);
        probe
            .resolve_in(realm)?
            .ok_or_else(|| CoreError::invalidated(format!("object {link} no longer exists")))
    }

    /// Resolves to a list read through `realm`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::resolve_object`].
    pub fn resolve_list(self, realm: &Realm) -> CoreResult<List> {
        let Target::List(target) = &self.target else {
            return Err(self.mismatch("list"));
        };
        self.collection(realm, target)?;
        Ok(List::new(realm.clone(), target.clone()))
    }

    /// Resolves to a set read through `realm`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::resolve_object`].
    pub fn resolve_set(self, realm: &Realm) -> CoreResult<Set> {
        let Target::Set(target) = &self.target else {
            return Err(self.mismatch("set"));
        };
        self.collection(realm, target)?;
        Ok(Set::new(realm.clone(), target.clone()))
    }

    /// Resolves to a dictionary read through `realm`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::resolve_object`].
    pub fn resolve_dictionary(self, realm: &Realm) -> CoreResult<Dictionary> {
        let Target::Dictionary(target) = &self.target else {
            return Err(self.mismatch("dictionary"));
        };
        self.collection(realm, target)?;
        Ok(Dictionary::new(realm.clone(), target.clone()))
    }

    /// Resolves to results read through `realm`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSafeReference::resolve_object`].
    pub fn resolve_results(self, realm: &Realm) -> CoreResult<Results> {
        let Target::Results { source, stages } = &self.target else {
            return Err(self.mismatch("results"));
        };
        self.prepare(realm)?;
        Results::new(realm.clone(), source.clone(), stages.clone()).resolve_in(realm)
    }

    /// Opens the referenced realm on the calling thread, driven by
    /// `scheduler` or a new manual scheduler.
    ///
    /// # Errors
    ///
    /// Fails like [`Realm::open`].
    pub fn resolve_realm(self, scheduler: Option<Arc<dyn Scheduler>>) -> CoreResult<Realm> {
        let Target::Realm(config) = self.target else {
            return Err(self.mismatch("realm"));
        };
        let mut config = *config;
        config.scheduler = scheduler;
        let realm = Realm::open(config)?;
        if let Some(version) = self.version {
            realm.begin_read()?;
            if realm.version_id()?.is_some_and(|current| current < version) {
                realm.refresh()?;
            }
        }
        Ok(realm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::RealmConfig;
    use crate::schema::{ObjectSchema, Property, PropertyType, Schema};
    use crate::value::Value;
    use std::thread;

    fn config(name: &str) -> RealmConfig {
        let schema = Schema::new(vec![ObjectSchema::new("Task")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("done", PropertyType::Bool))
            .property(Property::new("tags", PropertyType::String).list())]);
        RealmConfig::in_memory(name).schema(schema, 1)
    }

    #[test]
    fn objects_and_results_cross_threads() {
        let realm = Realm::open(config("tsr-cross")).unwrap();
        let task = realm
            .write(|r| {
                let task = r.create_object_with_primary_key("Task", 1)?;
                task.get_list("tags")?.push("home")?;
                Ok(task)
            })
            .unwrap();
        let object_ref = ThreadSafeReference::from_object(&task).unwrap();
        let list_ref = ThreadSafeReference::from_list(&task.get_list("tags").unwrap()).unwrap();
        let results_ref = ThreadSafeReference::from_results(
            &realm.find_all("Task").unwrap().filter("done == false", &[]).unwrap(),
        )
        .unwrap();
        let realm_ref = ThreadSafeReference::from_realm(&realm).unwrap();
        assert_eq!(results_ref.kind(), "results");

        let cfg = config("tsr-cross");
        thread::spawn(move || {
            let there = realm_ref.resolve_realm(None).unwrap();
            let other = Realm::open(cfg).unwrap();
            assert_eq!(there.path(), other.path());
            let task = object_ref.resolve_object(&other).unwrap();
            assert_eq!(task.get_value("_id").unwrap(), Value::Int(1));
            let tags = list_ref.resolve_list(&other).unwrap();
            assert_eq!(tags.get(0).unwrap(), Value::from("home"));
            assert_eq!(results_ref.resolve_results(&other).unwrap().count().unwrap(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn frozen_sources_are_rejected() {
        let realm = Realm::open(config("tsr-frozen")).unwrap();
        let task = realm
            .write(|r| r.create_object_with_primary_key("Task", 1))
            .unwrap();
        let frozen = realm.freeze().unwrap();
        let frozen_task = task.resolve_in(&frozen).unwrap().unwrap();
        assert!(matches!(
            ThreadSafeReference::from_object(&frozen_task),
            Err(CoreError::IllegalOperation { .. })
        ));
        assert!(matches!(
            ThreadSafeReference::from_realm(&frozen),
            Err(CoreError::IllegalOperation { .. })
        ));
        assert!(matches!(
            ThreadSafeReference::from_results(&realm.find_all("Task").unwrap().freeze().unwrap()),
            Err(CoreError::IllegalOperation { .. })
        ));
    }

    #[test]
    fn deleted_targets_are_invalidated() {
        let realm = Realm::open(config("tsr-deleted")).unwrap();
        let task = realm
            .write(|r| r.create_object_with_primary_key("Task", 1))
            .unwrap();
        let object_ref = ThreadSafeReference::from_object(&task).unwrap();
        let list_ref = ThreadSafeReference::from_list(&task.get_list("tags").unwrap()).unwrap();
        realm.write(|_| task.delete()).unwrap();
        assert!(matches!(
            object_ref.resolve_object(&realm),
            Err(CoreError::Invalidated { .. })
        ));
        assert!(matches!(
            list_ref.resolve_list(&realm),
            Err(CoreError::Invalidated { .. })
        ));
        let realm_ref = ThreadSafeReference::from_realm(&realm).unwrap();
        assert!(matches!(
            realm_ref.resolve_set(&realm),
            Err(CoreError::IllegalOperation { .. })
        ));
    }
}
