//! Transactions, snapshots, primary keys and notifications across handles.

use parking_lot::Mutex;
use realmdb_core::{
    CollectionChangeSet, CoreError, ManualScheduler, Move, ObjectSchema, Property, PropertyType,
    Realm, RealmConfig, Schema, Value,
};
use realmdb_testkit::{add_dog, add_person, person_schema, with_temp_realm, TestRealm};
use std::sync::Arc;

fn names(realm: &Realm, class: &str) -> Vec<String> {
    let results = realm.find_all(class).unwrap();
    (0..results.count().unwrap())
        .map(|i| {
            match results.get_object(i).unwrap().get_value("name").unwrap() {
                Value::String(s) => s,
                other => panic!("unexpected name {other:?}"),
            }
        })
        .collect()
}

fn recorder() -> (
    Arc<Mutex<Vec<CollectionChangeSet>>>,
    impl FnMut(&CollectionChangeSet) + Send + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |changes: &CollectionChangeSet| sink.lock().push(changes.clone()))
}

#[test]
fn committed_writes_are_visible_and_rollbacks_are_not() {
    with_temp_realm(person_schema(), |realm| {
        realm
            .write(|r| add_person(r, 1, "Ann", 20).map(|_| ()))
            .unwrap();
        assert_eq!(names(realm, "Person"), vec!["Ann"]);

        realm.begin_write().unwrap();
        add_person(realm, 2, "Bob", 30).unwrap();
        realm.rollback().unwrap();
        assert_eq!(names(realm, "Person"), vec!["Ann"]);
    });
}

#[test]
fn failed_write_blocks_roll_back() {
    with_temp_realm(person_schema(), |realm| {
        let result: Result<(), _> = realm.write(|r| {
            add_person(r, 1, "Ann", 20)?;
            Err(CoreError::illegal("stop"))
        });
        assert!(result.is_err());
        assert!(!realm.is_writable());
        assert_eq!(realm.find_all("Person").unwrap().count().unwrap(), 0);
    });
}

#[test]
fn frozen_realms_keep_their_version() {
    with_temp_realm(person_schema(), |realm| {
        realm
            .write(|r| add_person(r, 1, "Ann", 20).map(|_| ()))
            .unwrap();
        let frozen = realm.freeze().unwrap();
        let pinned = frozen.version_id().unwrap();

        realm
            .write(|r| add_person(r, 2, "Bob", 30).map(|_| ()))
            .unwrap();
        assert_eq!(realm.find_all("Person").unwrap().count().unwrap(), 2);
        assert_eq!(frozen.find_all("Person").unwrap().count().unwrap(), 1);
        assert_eq!(frozen.version_id().unwrap(), pinned);
        assert!(realm.version_id().unwrap() > pinned);
    });
}

#[test]
fn readers_see_other_handles_after_refresh() {
    let test = TestRealm::open(person_schema()).unwrap();
    let other = test.reopen().unwrap();
    other.begin_read().unwrap();
    let before = other.version_id().unwrap();

    test.write(|r| add_person(r, 1, "Ann", 20).map(|_| ()))
        .unwrap();
    assert!(other.refresh().unwrap());
    assert!(other.version_id().unwrap() > before);
    assert_eq!(names(&other, "Person"), vec!["Ann"]);
}

#[test]
fn primary_keys_are_unique() {
    with_temp_realm(person_schema(), |realm| {
        realm.begin_write().unwrap();
        realm.create_object_with_primary_key("Person", 1).unwrap();
        assert!(matches!(
            realm.create_object_with_primary_key("Person", 1),
            Err(CoreError::DuplicatePrimaryKey { .. })
        ));
        let (_, created) = realm.get_or_create_with_primary_key("Person", 1).unwrap();
        assert!(!created);
        let (_, created) = realm.get_or_create_with_primary_key("Person", 2).unwrap();
        assert!(created);
        realm.commit().unwrap();
        assert_eq!(realm.find_all("Person").unwrap().count().unwrap(), 2);
    });
}

#[test]
fn adults_filter_and_sort() {
    with_temp_realm(person_schema(), |realm| {
        realm
            .write(|r| {
                add_person(r, 1, "Ann", 20)?;
                add_person(r, 2, "Tim", 12)?;
                add_person(r, 3, "Bea", 40)?;
                Ok(())
            })
            .unwrap();
        let adults = realm
            .find_all("Person")
            .unwrap()
            .filter("age > 18", &[])
            .unwrap()
            .sort(&[("age", false)])
            .unwrap();
        assert_eq!(adults.count().unwrap(), 2);
        assert_eq!(
            adults.get_object(0).unwrap().get_value("name").unwrap(),
            Value::from("Bea")
        );
        assert_eq!(
            adults.get_object(1).unwrap().get_value("name").unwrap(),
            Value::from("Ann")
        );
    });
}

#[test]
fn set_inserts_are_idempotent() {
    let schema = Schema::new(vec![ObjectSchema::new("Post")
        .property(Property::new("_id", PropertyType::Int).primary_key())
        .property(Property::new("tags", PropertyType::String).set())]);
    with_temp_realm(schema, |realm| {
        realm
            .write(|r| {
                let post = r.create_object_with_primary_key("Post", 1)?;
                let tags = post.get_set("tags")?;
                let (_, inserted) = tags.insert("rust")?;
                assert!(inserted);
                let (_, inserted) = tags.insert("rust")?;
                assert!(!inserted);
                assert_eq!(tags.size()?, 1);
                Ok(())
            })
            .unwrap();
    });
}

#[test]
fn deleting_an_owner_clears_backlinks() {
    with_temp_realm(person_schema(), |realm| {
        let dog = realm
            .write(|r| {
                let owner = add_person(r, 1, "Ann", 20)?;
                add_dog(r, &owner, 10, "Rex")
            })
            .unwrap();
        let owners = dog.backlinks("Person", "dogs").unwrap();
        assert_eq!(owners.count().unwrap(), 1);
        realm
            .write(|r| r.find_all("Person")?.get_object(0)?.delete())
            .unwrap();
        assert_eq!(owners.count().unwrap(), 0);
        assert!(dog.is_valid());
    });
}

#[test]
fn notifications_coalesce_commits() {
    let scheduler = ManualScheduler::new();
    let config = RealmConfig::in_memory("notifications-coalesce")
        .schema(person_schema(), 1)
        .scheduler(Arc::new(scheduler.clone()));
    let observer = Realm::open(config.clone()).unwrap();
    let writer = Realm::open(config).unwrap();

    let (seen, callback) = recorder();
    let _token = observer
        .find_all("Person")
        .unwrap()
        .add_notification_callback(None, callback)
        .unwrap();
    for id in 0..3 {
        writer
            .write(|r| add_person(r, id, "p", id).map(|_| ()))
            .unwrap();
    }
    assert!(seen.lock().is_empty());
    scheduler.run_pending();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].insertions.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(seen[0].deletions.is_empty());
}

#[test]
fn list_moves_are_reported() {
    let scheduler = ManualScheduler::new();
    let schema = Schema::new(vec![ObjectSchema::new("Holder")
        .property(Property::new("_id", PropertyType::Int).primary_key())
        .property(Property::new("ints", PropertyType::Int).list())]);
    let realm = Realm::open(
        RealmConfig::in_memory("notifications-list-move")
            .schema(schema, 1)
            .scheduler(Arc::new(scheduler.clone())),
    )
    .unwrap();
    let holder = realm
        .write(|r| {
            let holder = r.create_object_with_primary_key("Holder", 1)?;
            let list = holder.get_list("ints")?;
            for v in [10, 20, 30] {
                list.push(v)?;
            }
            Ok(holder)
        })
        .unwrap();
    scheduler.run_pending();

    let list = holder.get_list("ints").unwrap();
    let (seen, callback) = recorder();
    let _token = list.add_notification_callback(None, callback).unwrap();
    realm.write(|_| list.move_element(0, 2)).unwrap();
    scheduler.run_pending();

    assert_eq!(
        list.values().unwrap(),
        vec![Value::Int(20), Value::Int(30), Value::Int(10)]
    );
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].deletions.iter().collect::<Vec<_>>(), vec![0]);
    assert_eq!(seen[0].insertions.iter().collect::<Vec<_>>(), vec![2]);
    assert_eq!(seen[0].moves, vec![Move { from: 0, to: 2 }]);
}

#[test]
fn dropping_the_token_stops_notifications() {
    let scheduler = ManualScheduler::new();
    let config = RealmConfig::in_memory("notifications-token")
        .schema(person_schema(), 1)
        .scheduler(Arc::new(scheduler.clone()));
    let realm = Realm::open(config).unwrap();
    let (seen, callback) = recorder();
    let token = realm
        .find_all("Person")
        .unwrap()
        .add_notification_callback(None, callback)
        .unwrap();
    drop(token);
    realm
        .write(|r| add_person(r, 1, "Ann", 20).map(|_| ()))
        .unwrap();
    scheduler.run_pending();
    assert!(seen.lock().is_empty());
}

#[test]
fn class_keys_resolve_through_the_stored_schema() {
    with_temp_realm(person_schema(), |realm| {
        realm
            .write(|r| {
                let owner = add_person(r, 1, "Ann", 20)?;
                add_dog(r, &owner, 10, "Rex")?;
                add_dog(r, &owner, 11, "Max").map(|_| ())
            })
            .unwrap();
        let schema = realm.schema().unwrap();
        let mut keys = realm.class_keys().unwrap();
        let mut declared = schema.class_keys();
        keys.sort_unstable();
        declared.sort_unstable();
        assert_eq!(keys, declared);
        assert_eq!(keys.len(), 2);

        let dog = schema.find("Dog").and_then(|c| c.key).unwrap();
        assert_eq!(schema.find_by_key(dog).unwrap().name, "Dog");
        assert_eq!(realm.num_objects(dog).unwrap(), 2);
        let names: Vec<String> = realm
            .class_properties(dog)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert!(names.contains(&"owners".to_owned()));
        assert!(names.contains(&"name".to_owned()));
    });
}

#[test]
fn key_paths_follow_links() {
    with_temp_realm(person_schema(), |realm| {
        let paths = realm
            .create_key_path_array("Person", &["name", "dogs.name", "best_friend.age"])
            .unwrap();
        assert_eq!(paths.len(), 3);
        assert!(matches!(
            realm.create_key_path_array("Person", &["name.length"]),
            Err(CoreError::IllegalOperation { .. })
        ));
        assert!(matches!(
            realm.create_key_path_array("Person", &["missing"]),
            Err(CoreError::NoSuchProperty { .. })
        ));
    });
}

#[test]
fn schema_changes_from_another_handle_are_announced() {
    let scheduler = ManualScheduler::new();
    let config = RealmConfig::in_memory("notifications-schema")
        .schema(person_schema(), 1)
        .scheduler(Arc::new(scheduler.clone()));
    let observer = Realm::open(config.clone()).unwrap();
    let writer = Realm::open(config).unwrap();
    observer.begin_read().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _token = observer
        .add_schema_changed_callback(move |schema: &Schema| {
            sink.lock().push(schema.find("Note").is_some());
        })
        .unwrap();

    let extended = Schema::new(
        person_schema()
            .iter()
            .cloned()
            .chain([ObjectSchema::new("Note").property(Property::new("text", PropertyType::String))])
            .collect(),
    );
    writer.update_schema(extended, 2, None).unwrap();
    scheduler.run_pending();

    assert_eq!(*seen.lock(), vec![true]);
    assert!(observer.find_class("Note").unwrap().is_some());
}
