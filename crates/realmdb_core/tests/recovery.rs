//! Reopening files after crashes and checking queries against a model.

use proptest::prelude::*;
use realmdb_core::Realm;
use realmdb_testkit::crash::{append_garbage, tear_tail};
use realmdb_testkit::{add_person, people_strategy, person_schema, proptest_config, TestRealm};

fn people_in_commits(count: i64) -> TestRealm {
    let test = TestRealm::open(person_schema()).unwrap();
    for id in 0..count {
        test.write(|r| add_person(r, id, "p", id).map(|_| ()))
            .unwrap();
    }
    test
}

fn count_after_reopen(test: TestRealm, damage: impl FnOnce(&std::path::Path)) -> usize {
    let config = test.config();
    let dir = test.into_dir();
    damage(&dir.path().join(TestRealm::FILE_NAME));
    let realm = Realm::open(config).unwrap();
    realm.find_all("Person").unwrap().count().unwrap()
}

#[test]
fn a_torn_last_commit_is_dropped() {
    let count = count_after_reopen(people_in_commits(3), |path| {
        tear_tail(path, 1).unwrap();
    });
    assert_eq!(count, 2);
}

#[test]
fn trailing_garbage_is_ignored() {
    let count = count_after_reopen(people_in_commits(3), |path| {
        append_garbage(path, b"\x00\x01not a record").unwrap();
    });
    assert_eq!(count, 3);
}

#[test]
fn recovered_files_accept_new_commits() {
    let test = people_in_commits(2);
    let config = test.config();
    let dir = test.into_dir();
    append_garbage(&dir.path().join(TestRealm::FILE_NAME), b"junk").unwrap();

    let realm = Realm::open(config.clone()).unwrap();
    realm
        .write(|r| add_person(r, 9, "late", 9).map(|_| ()))
        .unwrap();
    realm.close().unwrap();
    drop(realm);

    let report = Realm::describe_file(&dir.path().join(TestRealm::FILE_NAME)).unwrap();
    assert!(report.tail_error.is_none());
    assert_eq!(report.valid_len, report.total_len);
    let realm = Realm::open(config).unwrap();
    assert_eq!(realm.find_all("Person").unwrap().count().unwrap(), 3);
}

proptest! {
    #![proptest_config(proptest_config(16))]

    #[test]
    fn age_filter_matches_a_plain_scan(people in people_strategy(20)) {
        let test = TestRealm::in_memory(person_schema()).unwrap();
        test.write(|r| {
            for person in &people {
                add_person(r, person.id, &person.name, person.age)?;
            }
            Ok(())
        })
        .unwrap();
        let expected = people.iter().filter(|p| p.age > 18).count();
        let adults = test.find_all("Person").unwrap().filter("age > 18", &[]).unwrap();
        prop_assert_eq!(adults.count().unwrap(), expected);
    }
}
