//! Sync sessions: the per-realm handle applications hold.

use crate::client::{deliver, ClientHandle};
use crate::config::SyncConfig;
use crate::driver::{SessionDriver, Waiter};
use crate::error::{SyncError, SyncResult};
use crate::error_info::SyncErrorInfo;
use crate::manager::FileActions;
use crate::progress::{ProgressCallback, ProgressDirection, ProgressNotifiers};
use crate::subscriptions::{SubscriptionSet, SubscriptionStore};
use crate::user::SyncUser;
use parking_lot::Mutex;
use realmdb_core::{RealmConfig, Scheduler};
use realmdb_sync_protocol::FileIdent;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Syncing.
    Active,
    /// Closed by the application; finishing its uploads first.
    Dying,
    /// Not syncing.
    Inactive,
    /// Waiting for the user to log in.
    WaitingForAccessToken,
    /// Paused by the application.
    Paused,
}

/// State of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Connecting.
    Connecting,
    /// Connected.
    Connected,
}

/// Called with the old and new connection state.
pub type ConnectionStateCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// State shared between session handles and the driver on the worker.
pub(crate) struct SessionShared {
    pub id: u64,
    pub path: PathBuf,
    pub realm_config: RealmConfig,
    pub config: SyncConfig,
    pub client: ClientHandle,
    pub progress: ProgressNotifiers,
    pub subscriptions: Option<Arc<SubscriptionStore>>,
    pub file_actions: Arc<FileActions>,
    state: Mutex<SessionState>,
    connection_state: Mutex<ConnectionState>,
    file_ident: Mutex<Option<FileIdent>>,
    connection_callbacks: Mutex<BTreeMap<u64, ConnectionStateCallback>>,
    next_token: AtomicU64,
}

impl SessionShared {
    pub fn new(
        id: u64,
        realm_config: RealmConfig,
        config: SyncConfig,
        client: ClientHandle,
        subscriptions: Option<Arc<SubscriptionStore>>,
        file_actions: Arc<FileActions>,
    ) -> Self {
        Self {
            id,
            path: realm_config.path.clone(),
            realm_config,
            config,
            client,
            progress: ProgressNotifiers::default(),
            subscriptions,
            file_actions,
            state: Mutex::new(SessionState::Inactive),
            connection_state: Mutex::new(ConnectionState::Disconnected),
            file_ident: Mutex::new(None),
            connection_callbacks: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let old = std::mem::replace(&mut *self.state.lock(), state);
        if old != state {
            tracing::debug!(
                target: "realm.sync.client.session",
                path = %self.path.display(),
                from = ?old,
                to = ?state,
                "session state changed"
            );
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let old = std::mem::replace(&mut *self.connection_state.lock(), state);
        if old == state {
            return;
        }
        tracing::debug!(
            target: "realm.sync.client",
            path = %self.path.display(),
            from = ?old,
            to = ?state,
            "connection state changed"
        );
        let callbacks: Vec<ConnectionStateCallback> = self.connection_callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            self.deliver(move || callback(old, state));
        }
    }

    pub fn set_file_ident(&self, ident: Option<FileIdent>) {
        *self.file_ident.lock() = ident;
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.realm_config.scheduler.as_ref()
    }

    /// Runs `f` on the application's scheduler, or on the worker when the
    /// realm has none.
    pub fn deliver(&self, f: impl FnOnce() + Send + 'static) {
        deliver(self.scheduler(), f);
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues `f` for this session's driver.
    fn post(&self, f: impl FnOnce(&mut SessionDriver) + Send + 'static) -> bool {
        let id = self.id;
        self.client.post(move |worker| worker.with_driver(id, f))
    }
}

/// A realm's connection to the server.
///
/// Handles are cheap to clone and can be used from any thread. Commands
/// are carried out asynchronously on the sync client thread; callbacks
/// run on the realm's scheduler when it has one.
#[derive(Clone)]
pub struct SyncSession {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

impl SyncSession {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn subscription_store(&self) -> Option<&Arc<SubscriptionStore>> {
        self.shared.subscriptions.as_ref()
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    /// Path of the synced realm.
    pub fn file_path(&self) -> &Path {
        &self.shared.path
    }

    /// Identity the server gave this realm file, once bound.
    pub fn file_ident(&self) -> Option<FileIdent> {
        *self.shared.file_ident.lock()
    }

    /// The partition value, for partition based sync.
    pub fn partition_value(&self) -> Option<&str> {
        self.shared.config.partition_value()
    }

    /// The user the session authenticates as.
    pub fn user(&self) -> Arc<dyn SyncUser> {
        Arc::clone(&self.shared.config.user)
    }

    /// The session's sync settings.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Stops syncing until [`SyncSession::resume`]. Only active sessions
    /// and sessions waiting for an access token can be paused.
    pub fn pause(&self) {
        self.shared.post(SessionDriver::pause);
    }

    /// Resumes a paused or inactive session.
    pub fn resume(&self) {
        self.shared.post(SessionDriver::resume);
    }

    /// Closes the session according to its stop policy.
    pub fn close(&self) {
        self.shared.post(SessionDriver::close);
    }

    /// Stops the session at once, whatever the stop policy.
    pub fn force_close(&self) {
        self.shared.post(SessionDriver::force_close);
    }

    /// Reactivates a dying or closed session, as when its realm is opened
    /// again.
    pub fn revive_if_needed(&self) {
        self.shared.post(SessionDriver::revive);
    }

    /// Reconnects now if the session is waiting to reconnect.
    pub fn handle_reconnect(&self) {
        self.shared.post(SessionDriver::reconnect_now);
    }

    /// Calls `callback` with upload or download progress.
    ///
    /// A streaming notifier follows every change. Otherwise the total is
    /// fixed at registration and the notifier is removed once it is
    /// reached. Returns a token for
    /// [`SyncSession::unregister_progress_notifier`].
    pub fn register_progress_notifier(
        &self,
        direction: ProgressDirection,
        streaming: bool,
        callback: impl Fn(crate::Progress) + Send + Sync + 'static,
    ) -> u64 {
        let shared = Arc::downgrade(&self.shared);
        let callback = Arc::new(callback);
        let delivered: ProgressCallback = Arc::new(move |progress| {
            if let Some(shared) = shared.upgrade() {
                let callback = Arc::clone(&callback);
                shared.deliver(move || callback(progress));
            }
        });
        self.shared.progress.register(direction, streaming, delivered)
    }

    /// Removes a progress notifier.
    pub fn unregister_progress_notifier(&self, token: u64) {
        self.shared.progress.unregister(token);
    }

    /// Calls `callback` with the old and new state on every connection
    /// state change. Returns a token for
    /// [`SyncSession::unregister_connection_state_callback`].
    pub fn register_connection_state_callback(
        &self,
        callback: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> u64 {
        let token = self.shared.next_token();
        self.shared.connection_callbacks.lock().insert(token, Arc::new(callback));
        token
    }

    /// Removes a connection state callback.
    pub fn unregister_connection_state_callback(&self, token: u64) {
        self.shared.connection_callbacks.lock().remove(&token);
    }

    /// Calls `callback` once every local change made so far is on the
    /// server.
    pub fn wait_for_upload_completion(&self, callback: impl FnOnce(SyncResult<()>) + Send + 'static) {
        self.wait(ProgressDirection::Upload, self.delivered(callback));
    }

    /// Calls `callback` once every server change made so far is in the
    /// realm.
    pub fn wait_for_download_completion(&self, callback: impl FnOnce(SyncResult<()>) + Send + 'static) {
        self.wait(ProgressDirection::Download, self.delivered(callback));
    }

    /// Blocks until every local change made so far is on the server.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] when `timeout` passes first and the
    /// session's error when it stops.
    pub fn wait_for_upload_completion_blocking(&self, timeout: Duration) -> SyncResult<()> {
        self.wait_blocking(ProgressDirection::Upload, timeout)
    }

    /// Blocks until every server change made so far is in the realm.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] when `timeout` passes first and the
    /// session's error when it stops.
    pub fn wait_for_download_completion_blocking(&self, timeout: Duration) -> SyncResult<()> {
        self.wait_blocking(ProgressDirection::Download, timeout)
    }

    fn delivered(&self, callback: impl FnOnce(SyncResult<()>) + Send + 'static) -> Waiter {
        let shared = Arc::clone(&self.shared);
        Box::new(move |result| shared.deliver(move || callback(result)))
    }

    fn wait(&self, direction: ProgressDirection, waiter: Waiter) {
        let posted = self.shared.post(move |driver| match direction {
            ProgressDirection::Upload => driver.add_upload_waiter(waiter),
            ProgressDirection::Download => driver.add_download_waiter(waiter),
        });
        if !posted {
            tracing::warn!(target: "realm.sync.client.session", "wait requested after the sync client stopped");
        }
    }

    fn wait_blocking(&self, direction: ProgressDirection, timeout: Duration) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel();
        self.wait(
            direction,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SyncError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SyncError::ClientStopped),
        }
    }

    /// Handles `error` as if the server had reported it.
    pub fn handle_error_for_testing(&self, error: SyncErrorInfo) {
        self.shared.post(move |driver| driver.on_error(error));
    }

    /// The newest subscription set.
    ///
    /// # Errors
    ///
    /// Fails unless the session uses flexible sync.
    pub fn latest_subscription_set(&self) -> SyncResult<SubscriptionSet> {
        Ok(self.store()?.latest())
    }

    /// The newest complete subscription set.
    ///
    /// # Errors
    ///
    /// Fails unless the session uses flexible sync.
    pub fn active_subscription_set(&self) -> SyncResult<SubscriptionSet> {
        Ok(self.store()?.active())
    }

    fn store(&self) -> SyncResult<&Arc<SubscriptionStore>> {
        self.shared
            .subscriptions
            .as_ref()
            .ok_or_else(|| SyncError::wrong_state("subscriptions need flexible sync"))
    }
}
