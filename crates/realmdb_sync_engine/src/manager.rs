//! The sync manager: one sync client and the sessions of every synced
//! realm in the process.

use crate::client::SyncClient;
use crate::config::{SyncClientConfig, SyncConfig};
use crate::driver::SessionDriver;
use crate::error::{SyncError, SyncResult};
use crate::history::ClientHistory;
use crate::session::{SessionShared, SessionState, SyncSession};
use crate::subscriptions::SubscriptionStore;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use realmdb_core::{Realm, RealmConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

/// What must happen to a realm file before it can be used again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Delete the file; the server asked for it.
    DeleteRealm,
    /// Copy the file to `recovery_path`, then delete it. Left behind by a
    /// manual client reset.
    BackUpThenDeleteRealm {
        /// Where the copy goes.
        recovery_path: PathBuf,
    },
}

/// File actions waiting for their realm to be closed.
#[derive(Debug, Default)]
pub(crate) struct FileActions {
    actions: Mutex<HashMap<PathBuf, FileAction>>,
}

impl FileActions {
    pub fn insert(&self, path: PathBuf, action: FileAction) {
        tracing::info!(target: "realm.sync", path = %path.display(), ?action, "file action pending");
        self.actions.lock().insert(path, action);
    }

    pub fn get(&self, path: &Path) -> Option<FileAction> {
        self.actions.lock().get(path).cloned()
    }

    pub fn remove(&self, path: &Path) -> Option<FileAction> {
        self.actions.lock().remove(path)
    }
}

/// Owns the sync client and hands out one session per synced realm file.
///
/// ```no_run
/// use realmdb_core::RealmConfig;
/// use realmdb_sync_engine::{MockTransport, SyncClientConfig, SyncConfig, SyncManager, TokenUser};
/// use std::sync::Arc;
///
/// let transport = MockTransport::new(|_| Vec::new());
/// let manager = SyncManager::new(SyncClientConfig::default(), Arc::new(transport)).unwrap();
/// let user = Arc::new(TokenUser::new("alice", "token"));
/// let (realm, session) = manager
///     .open_synced_realm(RealmConfig::new("tasks.realm"), SyncConfig::flexible(user))
///     .unwrap();
/// # drop((realm, session));
/// ```
pub struct SyncManager {
    client: SyncClient,
    client_config: Arc<SyncClientConfig>,
    transport: Arc<dyn SyncTransport>,
    sessions: Mutex<HashMap<PathBuf, SyncSession>>,
    file_actions: Arc<FileActions>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("client_config", &self.client_config)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Starts the sync client thread.
    ///
    /// # Errors
    ///
    /// Fails when the thread or its runtime cannot be created.
    pub fn new(config: SyncClientConfig, transport: Arc<dyn SyncTransport>) -> SyncResult<Self> {
        Ok(Self {
            client: SyncClient::start()?,
            client_config: Arc::new(config),
            transport,
            sessions: Mutex::new(HashMap::new()),
            file_actions: Arc::new(FileActions::default()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Client settings.
    pub fn config(&self) -> &SyncClientConfig {
        &self.client_config
    }

    /// The session for `realm_config`'s file, created on first use.
    ///
    /// # Errors
    ///
    /// Fails when the subscription store of a flexible sync realm cannot
    /// be read.
    pub fn get_session(&self, realm_config: &RealmConfig, config: SyncConfig) -> SyncResult<SyncSession> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&realm_config.path) {
            session.revive_if_needed();
            return Ok(session.clone());
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let handle = self.client.handle().clone();
        let subscriptions = if config.is_flexible() {
            let store = SubscriptionStore::load(
                &realm_config.path,
                realm_config.in_memory,
                realm_config.scheduler.clone(),
            )?;
            let hook_handle = handle.clone();
            store.set_on_commit(Some(Arc::new(move |_version| {
                hook_handle.post(move |worker| worker.with_driver(id, SessionDriver::on_subscriptions_committed));
            })));
            Some(store)
        } else {
            None
        };
        let shared = Arc::new(SessionShared::new(
            id,
            realm_config.clone(),
            config,
            handle.clone(),
            subscriptions,
            Arc::clone(&self.file_actions),
        ));
        let driver = SessionDriver::new(
            Arc::clone(&shared),
            handle.clone(),
            Arc::clone(&self.client_config),
            Arc::clone(&self.transport),
        );
        let (started, wait) = mpsc::channel();
        if !handle.post(move |worker| {
            worker.start_driver(driver);
            let _ = started.send(());
        }) {
            return Err(SyncError::ClientStopped);
        }
        tracing::debug!(target: "realm.sync", path = %realm_config.path.display(), session = id, "created sync session");
        let session = SyncSession::from_shared(shared);
        sessions.insert(realm_config.path.clone(), session.clone());
        drop(sessions);

        // Commits made once this returns must reach the driver's observer.
        if !self.client.is_worker_thread() {
            wait.recv().map_err(|_| SyncError::ClientStopped)?;
        }
        Ok(session)
    }

    /// The session for `path`, if one exists.
    pub fn get_existing_session(&self, path: &Path) -> Option<SyncSession> {
        self.sessions.lock().get(path).cloned()
    }

    /// Every session.
    pub fn all_sessions(&self) -> Vec<SyncSession> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Whether any session is still syncing.
    pub fn has_existing_sessions(&self) -> bool {
        self.sessions
            .lock()
            .values()
            .any(|s| s.state() != SessionState::Inactive)
    }

    /// Opens a synced realm and its session.
    ///
    /// Pending file actions for the path run first. A flexible sync realm
    /// gets its initial subscriptions on first open, or on every open when
    /// configured to rerun them.
    ///
    /// # Errors
    ///
    /// Fails when the realm cannot be opened, a file action fails or the
    /// initial subscriptions fail.
    pub fn open_synced_realm(&self, realm_config: RealmConfig, config: SyncConfig) -> SyncResult<(Realm, SyncSession)> {
        let realm_config = realm_config.synced(config.is_flexible());
        if self.get_existing_session(&realm_config.path).is_none()
            && self.file_actions.get(&realm_config.path).is_some()
        {
            self.immediately_run_file_actions(&realm_config.path)?;
        }
        let realm = Realm::open(realm_config.clone())?;
        let initial = config.initial_subscriptions.clone();
        let rerun = config.rerun_initial_subscriptions_on_open;
        let session = self.get_session(&realm_config, config)?;

        if let (Some(initial), Some(store)) = (initial, session.subscription_store()) {
            let latest = store.latest();
            if latest.version() == 0 || rerun {
                let mut mutable = latest.make_mutable_copy();
                initial(&realm, &mut mutable)?;
                let committed = mutable.commit()?;
                tracing::debug!(target: "realm.sync", version = committed.version(), "initial subscriptions committed");
            }
        }
        Ok((realm, session))
    }

    /// Asks every session waiting to reconnect to try now.
    pub fn reconnect(&self) {
        for session in self.all_sessions() {
            session.handle_reconnect();
        }
    }

    /// The file action waiting for `path`, if any.
    pub fn pending_file_action(&self, path: &Path) -> Option<FileAction> {
        self.file_actions.get(path)
    }

    /// Runs the file action left for `path` by a client reset or the
    /// server. Returns whether there was one.
    ///
    /// Every handle of the realm must be closed first.
    ///
    /// # Errors
    ///
    /// Fails while the realm's session is still syncing, while the realm
    /// is open, or when a file cannot be copied or removed.
    pub fn immediately_run_file_actions(&self, path: &Path) -> SyncResult<bool> {
        let Some(action) = self.file_actions.get(path) else {
            return Ok(false);
        };
        let session = self.get_existing_session(path);
        if session
            .as_ref()
            .is_some_and(|s| s.state() != SessionState::Inactive)
        {
            return Err(SyncError::wrong_state("the realm's session is still active"));
        }
        if let FileAction::BackUpThenDeleteRealm { recovery_path } = &action {
            if path.exists() {
                if let Some(parent) = recovery_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(path, recovery_path)?;
                tracing::info!(
                    target: "realm.sync",
                    path = %path.display(),
                    backup = %recovery_path.display(),
                    "backed up realm"
                );
            }
        }
        Realm::delete_files(path)?;
        ClientHistory::delete_file(path)?;
        SubscriptionStore::delete_file(path)?;
        self.file_actions.remove(path);
        if let Some(session) = session {
            self.sessions.lock().remove(path);
            let id = session.id();
            self.client.handle().post(move |worker| worker.remove_driver(id));
        }
        tracing::info!(target: "realm.sync", path = %path.display(), ?action, "ran file action");
        Ok(true)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.client.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::user::TokenUser;
    use crate::ReconnectMode;
    use realmdb_core::{ObjectSchema, Property, PropertyType, Schema};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![ObjectSchema::new("Task")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("name", PropertyType::String))])
    }

    fn manager() -> SyncManager {
        let transport = MockTransport::new(|_| Vec::new());
        transport.set_online(false);
        SyncManager::new(
            SyncClientConfig::default().with_reconnect_mode(ReconnectMode::Testing),
            Arc::new(transport),
        )
        .unwrap()
    }

    #[test]
    fn one_session_per_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let user = Arc::new(TokenUser::new("alice", "token"));
        let config = RealmConfig::new(dir.path().join("a.realm")).schema(schema(), 1);
        let (_realm, first) = manager
            .open_synced_realm(config.clone(), SyncConfig::partition(user.clone(), "p"))
            .unwrap();
        let second = manager
            .get_session(&config, SyncConfig::partition(user, "p"))
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.all_sessions().len(), 1);
        assert_eq!(second.partition_value(), Some("p"));
    }

    #[test]
    fn initial_subscriptions_run_on_first_open() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let user = Arc::new(TokenUser::new("alice", "token"));
        let config = SyncConfig::flexible(user).with_initial_subscriptions(
            |_realm, subs| {
                subs.insert_or_assign_query(Some("tasks"), "Task", "TRUEPREDICATE");
                Ok(())
            },
            false,
        );
        let (_realm, session) = manager
            .open_synced_realm(RealmConfig::new(dir.path().join("f.realm")).schema(schema(), 1), config)
            .unwrap();
        let latest = session.latest_subscription_set().unwrap();
        assert_eq!(latest.version(), 1);
        assert!(latest.find_by_name("tasks").is_some());
    }

    #[test]
    fn file_actions_need_an_inactive_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.realm");
        let manager = manager();
        assert!(!manager.immediately_run_file_actions(&path).unwrap());

        manager.file_actions.insert(path.clone(), FileAction::DeleteRealm);
        std::fs::write(&path, b"stale").unwrap();
        assert!(manager.immediately_run_file_actions(&path).unwrap());
        assert!(!path.exists());
        assert_eq!(manager.pending_file_action(&path), None);
    }
}
