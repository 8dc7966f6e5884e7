//! Test fixtures and realm helpers.
//!
//! Provides temporary realms and the schemas most tests share.

use realmdb_core::{
    CoreResult, Object, ObjectSchema, Property, PropertyType, Realm, RealmConfig, Schema, Uuid,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A realm in a temporary location with automatic cleanup.
pub struct TestRealm {
    /// The realm instance.
    pub realm: Realm,
    path: PathBuf,
    /// Kept alive to prevent cleanup.
    _temp_dir: Option<TempDir>,
}

impl TestRealm {
    /// File name of file-based test realms inside their directory.
    pub const FILE_NAME: &'static str = "test.realm";

    /// Opens a new file-based realm with `schema` at version 1.
    ///
    /// # Errors
    ///
    /// Fails when the temporary directory or the realm cannot be created.
    pub fn open(schema: Schema) -> CoreResult<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(Self::FILE_NAME);
        let realm = Realm::open(RealmConfig::new(&path).schema(schema, 1))?;
        Ok(Self {
            realm,
            path,
            _temp_dir: Some(temp_dir),
        })
    }

    /// Opens a new in-memory realm with `schema` at version 1.
    ///
    /// # Errors
    ///
    /// Fails when the schema is invalid.
    pub fn in_memory(schema: Schema) -> CoreResult<Self> {
        let path = PathBuf::from(format!("test-{}", Uuid::new_v4()));
        let realm = Realm::open(RealmConfig::in_memory(&path).schema(schema, 1))?;
        Ok(Self {
            realm,
            path,
            _temp_dir: None,
        })
    }

    /// The realm path; a unique name for in-memory realms.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configuration the realm was opened with.
    pub fn config(&self) -> RealmConfig {
        self.realm.config().clone()
    }

    /// Opens another handle on the same realm.
    ///
    /// # Errors
    ///
    /// See [`Realm::open`].
    pub fn reopen(&self) -> CoreResult<Realm> {
        Realm::open(self.config())
    }

    /// Closes the realm and hands over its directory, keeping the file.
    ///
    /// # Panics
    ///
    /// Panics for in-memory realms.
    pub fn into_dir(self) -> TempDir {
        let Self {
            realm, _temp_dir, ..
        } = self;
        let _ = realm.close();
        drop(realm);
        _temp_dir.expect("in-memory realms have no directory")
    }
}

impl std::ops::Deref for TestRealm {
    type Target = Realm;

    fn deref(&self) -> &Self::Target {
        &self.realm
    }
}

/// `Person` and `Dog` classes.
///
/// `Person { _id: int (primary key), name: string (indexed), age: int,
/// dogs: [Dog], best_friend: Person? }` and
/// `Dog { _id: int (primary key), name: string, owners: linking objects }`.
pub fn person_schema() -> Schema {
    Schema::new(vec![
        ObjectSchema::new("Person")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("name", PropertyType::String).indexed())
            .property(Property::new("age", PropertyType::Int))
            .property(Property::object("dogs", "Dog").list())
            .property(Property::object("best_friend", "Person")),
        ObjectSchema::new("Dog")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("name", PropertyType::String))
            .property(Property::linking_objects("owners", "Person", "dogs")),
    ])
}

/// Creates or updates the person with `id`. Must run inside a write.
///
/// # Errors
///
/// Fails outside a write transaction or when `realm` lacks [`person_schema`].
pub fn add_person(realm: &Realm, id: i64, name: &str, age: i64) -> CoreResult<Object> {
    let (person, _) = realm.get_or_create_with_primary_key("Person", id)?;
    person.set_value("name", name)?;
    person.set_value("age", age)?;
    Ok(person)
}

/// Creates a dog owned by `owner`. Must run inside a write.
///
/// # Errors
///
/// Fails outside a write transaction or for a duplicate `id`.
pub fn add_dog(realm: &Realm, owner: &Object, id: i64, name: &str) -> CoreResult<Object> {
    let dog = realm.create_object_with_primary_key("Dog", id)?;
    dog.set_value("name", name)?;
    owner.get_list("dogs")?.push(dog.as_link())?;
    Ok(dog)
}

/// Runs a test with a temporary in-memory realm.
///
/// # Example
///
/// ```rust
/// use realmdb_testkit::{person_schema, with_temp_realm};
///
/// let count = with_temp_realm(person_schema(), |realm| {
///     realm.find_all("Dog").unwrap().count().unwrap()
/// });
/// assert_eq!(count, 0);
/// ```
///
/// # Panics
///
/// Panics when `schema` is invalid.
pub fn with_temp_realm<F, R>(schema: Schema, f: F) -> R
where
    F: FnOnce(&Realm) -> R,
{
    let test = TestRealm::in_memory(schema).expect("Failed to open in-memory realm");
    f(&test.realm)
}

/// Runs a test with a temporary file-based realm.
///
/// # Panics
///
/// Panics when the realm cannot be created.
pub fn with_file_realm<F, R>(schema: Schema, f: F) -> R
where
    F: FnOnce(&Realm, &Path) -> R,
{
    let test = TestRealm::open(schema).expect("Failed to open file realm");
    f(&test.realm, test.path())
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A file realm with `count` people aged `0..count`, named `person-<id>`.
    ///
    /// # Panics
    ///
    /// Panics when the realm cannot be created or written.
    pub fn populated_realm(count: i64) -> TestRealm {
        let test = TestRealm::open(person_schema()).expect("Failed to open file realm");
        test.write(|realm| {
            for id in 0..count {
                add_person(realm, id, &format!("person-{id}"), id)?;
            }
            Ok(())
        })
        .expect("Failed to add people");
        test
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_realms_survive_reopening() {
        let test = scenarios::populated_realm(5);
        let again = test.reopen().unwrap();
        assert_eq!(again.find_all("Person").unwrap().count().unwrap(), 5);
        assert!(test.path().ends_with(TestRealm::FILE_NAME));
    }

    #[test]
    fn in_memory_realms_are_isolated() {
        let a = TestRealm::in_memory(person_schema()).unwrap();
        let b = TestRealm::in_memory(person_schema()).unwrap();
        a.write(|realm| add_person(realm, 1, "Ada", 36).map(|_| ()))
            .unwrap();
        assert_eq!(b.find_all("Person").unwrap().count().unwrap(), 0);
    }

    #[test]
    fn dogs_link_back_to_their_owner() {
        with_temp_realm(person_schema(), |realm| {
            let dog = realm
                .write(|r| {
                    let owner = add_person(r, 1, "Ada", 36)?;
                    add_dog(r, &owner, 10, "Rex")
                })
                .unwrap();
            assert_eq!(dog.backlinks("Person", "dogs").unwrap().count().unwrap(), 1);
        });
    }

    #[test]
    fn add_person_updates_in_place() {
        with_temp_realm(person_schema(), |realm| {
            realm
                .write(|r| {
                    add_person(r, 1, "Ada", 36)?;
                    add_person(r, 1, "Ada", 37)?;
                    Ok(())
                })
                .unwrap();
            let people = realm.find_all("Person").unwrap();
            assert_eq!(people.count().unwrap(), 1);
            assert_eq!(
                people.get_object(0).unwrap().get_value("age").unwrap(),
                37.into()
            );
        });
    }
}
