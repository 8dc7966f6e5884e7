//! Flexible sync subscriptions against an in-process server.

mod common;

use common::{add_task, server_count, task_titles, wait_until, Harness, TIMEOUT};
use parking_lot::Mutex;
use realmdb_core::Realm;
use realmdb_sync_engine::{SubscriptionSetState, SyncConfig, SyncError, SyncErrorInfo, SyncSession};
use realmdb_sync_protocol::ProtocolErrorCode;
use std::sync::Arc;

fn seed(h: &Harness) {
    h.server
        .write(None, |realm| {
            for (id, title, done) in [(1, "plan", true), (2, "build", false), (3, "ship", false)] {
                let task = realm.create_object_with_primary_key("Task", id)?;
                task.set_value("title", title)?;
                task.set_value("done", done)?;
            }
            Ok(())
        })
        .unwrap();
}

fn open(h: &Harness, name: &str, config: SyncConfig) -> (Realm, SyncSession) {
    h.manager.open_synced_realm(h.realm_config(name), config).unwrap()
}

#[test]
fn a_new_set_bootstraps_and_completes() {
    let h = Harness::new();
    seed(&h);
    let (realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));

    let latest = session.latest_subscription_set().unwrap();
    assert_eq!(latest.version(), 0);
    assert_eq!(latest.state(), SubscriptionSetState::Complete);
    assert!(latest.is_empty());
    assert!(task_titles(&realm).is_empty());

    let mut mutable = latest.make_mutable_copy();
    assert_eq!(mutable.state(), SubscriptionSetState::Uncommitted);
    let (index, inserted) = mutable.insert_or_assign_query(None, "Task", "TRUEPREDICATE");
    assert_eq!((index, inserted), (0, true));
    let committed = mutable.commit().unwrap();
    assert_eq!(committed.version(), 1);

    assert_eq!(
        committed.wait_for_state(SubscriptionSetState::Complete, TIMEOUT).unwrap(),
        SubscriptionSetState::Complete
    );
    assert_eq!(task_titles(&realm), vec!["plan", "build", "ship"]);

    let active = session.active_subscription_set().unwrap();
    assert_eq!(active.version(), 1);
    assert_eq!(active.size(), 1);
    assert!(active.find_by_query("Task", "TRUEPREDICATE").is_some());
}

#[test]
fn narrowing_a_query_removes_objects_outside_it() {
    let h = Harness::new();
    seed(&h);
    let (realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));

    let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
    mutable.insert_or_assign_query(Some("tasks"), "Task", "TRUEPREDICATE");
    let all = mutable.commit().unwrap();
    all.wait_for_state(SubscriptionSetState::Complete, TIMEOUT).unwrap();
    assert_eq!(task_titles(&realm).len(), 3);

    let mut mutable = all.make_mutable_copy();
    let (index, inserted) = mutable.insert_or_assign_query(Some("tasks"), "Task", "done == false");
    assert_eq!((index, inserted), (0, false));
    let open_only = mutable.commit().unwrap();
    open_only.wait_for_state(SubscriptionSetState::Complete, TIMEOUT).unwrap();
    assert_eq!(task_titles(&realm), vec!["build", "ship"]);

    let mut all = all;
    all.refresh();
    assert_eq!(all.state(), SubscriptionSetState::Superseded);
}

#[test]
fn state_change_notifications_fire_once_reached() {
    let h = Harness::new();
    seed(&h);
    let (_realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));

    let reached = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&reached);
    session.pause();
    let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
    mutable.insert_or_assign_query(None, "Task", "done == true");
    let set = mutable.commit().unwrap();
    assert_eq!(set.state(), SubscriptionSetState::Pending);
    set.get_state_change_notification(SubscriptionSetState::Complete, move |result| {
        *sink.lock() = Some(result.map_err(|e| e.to_string()));
    });
    assert!(reached.lock().is_none());

    session.resume();
    assert!(wait_until(|| reached.lock().is_some()));
    assert_eq!(*reached.lock(), Some(Ok(SubscriptionSetState::Complete)));
}

#[test]
fn rejected_queries_put_the_set_in_error() {
    let h = Harness::new();
    let (_realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));

    let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
    mutable.insert_or_assign_query(None, "Task", "nonexistent == 1");
    let set = mutable.commit().unwrap();
    let result = set.wait_for_state(SubscriptionSetState::Complete, TIMEOUT);
    assert!(matches!(result, Err(SyncError::SubscriptionFailed(_))));

    let mut set = set;
    set.refresh();
    assert_eq!(set.state(), SubscriptionSetState::Error);
    assert!(set.error_str().is_some());
    assert_eq!(session.active_subscription_set().unwrap().version(), 0);
}

#[test]
fn initial_subscriptions_sync_on_open() {
    let h = Harness::new();
    seed(&h);
    let config = SyncConfig::flexible(h.user("alice")).with_initial_subscriptions(
        |_realm, subs| {
            subs.insert_or_assign_query(Some("open"), "Task", "done == false");
            Ok(())
        },
        false,
    );
    let (realm, session) = open(&h, "flx.realm", config);
    let latest = session.latest_subscription_set().unwrap();
    assert_eq!(latest.version(), 1);
    latest.wait_for_state(SubscriptionSetState::Complete, TIMEOUT).unwrap();
    assert_eq!(task_titles(&realm), vec!["build", "ship"]);
}

#[test]
fn local_writes_inside_subscriptions_upload() {
    let h = Harness::new();
    let (realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));
    let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
    mutable.insert_or_assign_query(None, "Task", "TRUEPREDICATE");
    mutable
        .commit()
        .unwrap()
        .wait_for_state(SubscriptionSetState::Complete, TIMEOUT)
        .unwrap();

    add_task(&realm, 10, "from flexible sync");
    session.wait_for_upload_completion_blocking(TIMEOUT).unwrap();
    assert_eq!(server_count(&h.server, None, "Task"), 1);
}

#[test]
fn read_only_writes_are_compensated() {
    let h = Harness::with_server(|config| config.with_read_only_class("Notice"));
    let errors = Arc::new(Mutex::new(Vec::<SyncErrorInfo>::new()));
    let sink = Arc::clone(&errors);
    let config = SyncConfig::flexible(h.user("alice")).with_error_handler(move |_session, error| sink.lock().push(error));
    let (realm, session) = open(&h, "flx.realm", config);

    let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
    mutable.insert_or_assign_query(None, "Notice", "TRUEPREDICATE");
    mutable
        .commit()
        .unwrap()
        .wait_for_state(SubscriptionSetState::Complete, TIMEOUT)
        .unwrap();

    realm
        .write(|realm| {
            let notice = realm.create_object_with_primary_key("Notice", 1)?;
            notice.set_value("text", "not allowed")
        })
        .unwrap();
    session.wait_for_upload_completion_blocking(TIMEOUT).unwrap();

    assert!(wait_until(|| !errors.lock().is_empty()));
    let error = errors.lock()[0].clone();
    assert_eq!(error.code, ProtocolErrorCode::CompensatingWrite.code());
    assert!(!error.is_fatal);
    assert_eq!(error.compensating_writes.len(), 1);
    assert_eq!(error.compensating_writes[0].object_name, "Notice");

    assert!(wait_until(|| {
        realm.refresh().unwrap();
        realm.find_all("Notice").unwrap().count().unwrap() == 0
    }));
    assert_eq!(server_count(&h.server, None, "Notice"), 0);
}

#[test]
fn reopening_keeps_the_active_set() {
    let h = Harness::new();
    seed(&h);
    {
        let (_realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));
        let mut mutable = session.latest_subscription_set().unwrap().make_mutable_copy();
        mutable.insert_or_assign_query(Some("all"), "Task", "TRUEPREDICATE");
        mutable
            .commit()
            .unwrap()
            .wait_for_state(SubscriptionSetState::Complete, TIMEOUT)
            .unwrap();
    }

    let (realm, session) = open(&h, "flx.realm", SyncConfig::flexible(h.user("alice")));
    let active = session.active_subscription_set().unwrap();
    assert_eq!(active.version(), 1);
    assert!(active.find_by_name("all").is_some());
    assert_eq!(task_titles(&realm).len(), 3);
}

#[test]
fn partition_sessions_have_no_subscriptions() {
    let h = Harness::new();
    let (_realm, session) = open(&h, "p.realm", SyncConfig::partition(h.user("alice"), "team"));
    assert!(matches!(session.latest_subscription_set(), Err(SyncError::WrongState(_))));
}
