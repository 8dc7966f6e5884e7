//! Client reset after the server forgets a realm's history.

mod common;

use common::{add_task, server_count, task_titles, wait_until, Harness, TIMEOUT};
use parking_lot::Mutex;
use realmdb_core::Realm;
use realmdb_sync_engine::{ClientResyncMode, FileAction, SessionState, SyncConfig, SyncErrorInfo, SyncSession};
use std::sync::Arc;

/// Opens a partition realm, syncs one task, then resets the server's
/// history so the client's next upload is refused.
fn synced_then_reset(h: &Harness, config: SyncConfig) -> (Realm, SyncSession) {
    let (realm, session) = h.manager.open_synced_realm(h.realm_config("a.realm"), config).unwrap();
    add_task(&realm, 1, "synced");
    session.wait_for_upload_completion_blocking(TIMEOUT).unwrap();
    h.server.reset_realm(Some("team")).unwrap();
    (realm, session)
}

#[derive(Default)]
struct Calls {
    before: Vec<usize>,
    after: Vec<(usize, bool)>,
}

fn with_callbacks(config: SyncConfig, calls: &Arc<Mutex<Calls>>) -> SyncConfig {
    let before = Arc::clone(calls);
    let after = Arc::clone(calls);
    config
        .with_before_client_reset(move |realm| {
            let count = realm.find_all("Task").unwrap().count().unwrap();
            before.lock().before.push(count);
        })
        .with_after_client_reset(move |_before, reference, did_recover| {
            let realm = reference.resolve_realm(None).unwrap();
            let count = realm.find_all("Task").unwrap().count().unwrap();
            after.lock().after.push((count, did_recover));
        })
}

#[test]
fn discarding_local_changes_keeps_the_server_copy() {
    let h = Harness::new();
    let calls = Arc::new(Mutex::new(Calls::default()));
    let config = with_callbacks(
        SyncConfig::partition(h.user("alice"), "team").with_client_resync_mode(ClientResyncMode::DiscardLocal),
        &calls,
    );
    let (realm, session) = synced_then_reset(&h, config);

    add_task(&realm, 2, "unsynced");
    assert!(wait_until(|| !calls.lock().after.is_empty()));
    {
        let calls = calls.lock();
        assert_eq!(calls.before, vec![2]);
        assert_eq!(calls.after, vec![(1, false)]);
    }
    assert_eq!(task_titles(&realm), vec!["synced"]);
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.file_ident().is_some());

    add_task(&realm, 3, "after reset");
    session.wait_for_upload_completion_blocking(TIMEOUT).unwrap();
    assert_eq!(server_count(&h.server, Some("team"), "Task"), 2);
}

#[test]
fn recovery_reapplies_local_changes() {
    let h = Harness::new();
    let calls = Arc::new(Mutex::new(Calls::default()));
    let config = with_callbacks(
        SyncConfig::partition(h.user("alice"), "team").with_client_resync_mode(ClientResyncMode::Recover),
        &calls,
    );
    let (realm, session) = synced_then_reset(&h, config);

    add_task(&realm, 2, "unsynced");
    assert!(wait_until(|| !calls.lock().after.is_empty()));
    assert_eq!(calls.lock().after, vec![(2, true)]);

    session.wait_for_upload_completion_blocking(TIMEOUT).unwrap();
    assert!(wait_until(|| server_count(&h.server, Some("team"), "Task") == 2));
    assert_eq!(task_titles(&realm), vec!["synced", "unsynced"]);
}

#[test]
fn manual_reset_leaves_the_files_to_the_application() {
    let h = Harness::new();
    let errors = Arc::new(Mutex::new(Vec::<SyncErrorInfo>::new()));
    let sink = Arc::clone(&errors);
    let config = SyncConfig::partition(h.user("alice"), "team")
        .with_client_resync_mode(ClientResyncMode::Manual)
        .with_recovery_directory(h.dir.path().join("backups"))
        .with_error_handler(move |_session, error| sink.lock().push(error));
    let (realm, session) = synced_then_reset(&h, config);

    add_task(&realm, 2, "unsynced");
    assert!(wait_until(|| session.state() == SessionState::Inactive));
    let error = errors.lock()[0].clone();
    assert!(error.is_client_reset_requested);
    assert!(error.is_fatal);
    let path = h.path("a.realm");
    assert_eq!(error.original_file_path(), Some(path.display().to_string().as_str()));
    let backup = std::path::PathBuf::from(error.recovery_file_path().unwrap());
    assert!(backup.starts_with(h.dir.path().join("backups")));

    match h.manager.pending_file_action(&path) {
        Some(FileAction::BackUpThenDeleteRealm { recovery_path }) => assert_eq!(recovery_path, backup),
        other => panic!("unexpected file action {other:?}"),
    }

    realm.close().unwrap();
    drop(realm);
    assert!(h.manager.immediately_run_file_actions(&path).unwrap());
    assert!(!path.exists());
    assert!(backup.exists());
    assert!(h.manager.pending_file_action(&path).is_none());
    assert!(h.manager.get_existing_session(&path).is_none());
}

#[test]
fn reopening_after_a_manual_reset_starts_fresh() {
    let h = Harness::new();
    let config = SyncConfig::partition(h.user("alice"), "team").with_client_resync_mode(ClientResyncMode::Manual);
    let (realm, session) = synced_then_reset(&h, config.clone());
    add_task(&realm, 2, "unsynced");
    assert!(wait_until(|| session.state() == SessionState::Inactive));
    drop(realm);
    drop(session);

    let path = h.path("a.realm");
    assert!(h.manager.immediately_run_file_actions(&path).unwrap());
    let (realm, session) = h.manager.open_synced_realm(h.realm_config("a.realm"), config).unwrap();
    session.wait_for_download_completion_blocking(TIMEOUT).unwrap();
    assert_eq!(task_titles(&realm), vec!["synced"]);
}
