//! The state machine behind a session, run on the sync client thread.
//!
//! A driver owns its own realm handle, history and connection. It turns
//! local commits into uploads, integrates downloads, drives subscription
//! sets through bootstrapping, and reacts to server errors.

mod reset;

use crate::client::ClientHandle;
use crate::config::{ReconnectMode, StopPolicy, SyncClientConfig, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::error_info::SyncErrorInfo;
use crate::history::ClientHistory;
use crate::manager::FileAction;
use crate::progress::ProgressDirection;
use crate::session::{ConnectionState, SessionShared, SessionState, SyncSession};
use crate::subscriptions::{SubscriptionSetState, SubscriptionStore};
use crate::transport::{ConnectParams, SyncConnection, SyncTransport};
use crate::user::UserState;
use realmdb_core::{
    CommitEvent, CommitOrigin, CommitSubscription, CoreResult, ObjectType, PrimaryKey, Realm, Timestamp,
};
use realmdb_sync_protocol::instructions::{capture_commit, is_syncable, wire_key, InstructionApplier};
use realmdb_sync_protocol::{
    BatchState, BindMode, ClientMessage, DownloadCursor, PrimaryKeyValue, ProtocolErrorCode, ServerChangeset,
    ServerMessage, ServerRequestsAction, PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use self::reset::ResetInProgress;

/// Completion callback of an upload or download wait.
pub(crate) type Waiter = Box<dyn FnOnce(SyncResult<()>) + Send>;

/// What a mark's echo means.
enum MarkPurpose {
    /// Everything the server had is downloaded.
    Download(Waiter),
    /// A subscription set's bootstrap is complete.
    Subscription(u64),
    /// The fresh copy after a client reset is downloaded.
    ClientReset,
}

struct Bootstrap {
    query_version: u64,
    changesets: Vec<ServerChangeset>,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    let now = Timestamp::now();
    now.seconds * 1000 + i64::from(now.nanoseconds / 1_000_000)
}

pub(crate) struct SessionDriver {
    shared: Arc<SessionShared>,
    handle: ClientHandle,
    client_config: Arc<SyncClientConfig>,
    transport: Arc<dyn SyncTransport>,
    realm: Option<Realm>,
    commits: Option<CommitSubscription>,
    history: ClientHistory,
    connection: Option<Box<dyn SyncConnection>>,
    bound: bool,
    generation: u64,
    reconnect_attempt: u32,
    connected_at: Option<Instant>,
    next_mark: u64,
    marks: BTreeMap<u64, MarkPurpose>,
    upload_waiters: Vec<(u64, Waiter)>,
    bootstrap: Option<Bootstrap>,
    sent_query_version: u64,
    reset: Option<ResetInProgress>,
    downloaded_bytes: u64,
    failed: bool,
}

impl SessionDriver {
    pub fn new(
        shared: Arc<SessionShared>,
        handle: ClientHandle,
        client_config: Arc<SyncClientConfig>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        Self {
            shared,
            handle,
            client_config,
            transport,
            realm: None,
            commits: None,
            history: ClientHistory::in_memory(),
            connection: None,
            bound: false,
            generation: 0,
            reconnect_attempt: 0,
            connected_at: None,
            next_mark: 1,
            marks: BTreeMap::new(),
            upload_waiters: Vec::new(),
            bootstrap: None,
            sent_query_version: 0,
            reset: None,
            downloaded_bytes: 0,
            failed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    fn store(&self) -> Option<Arc<SubscriptionStore>> {
        self.shared.subscriptions.clone()
    }

    fn is_running(&self) -> bool {
        matches!(self.shared.state(), SessionState::Active | SessionState::Dying)
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn start(&mut self) {
        if let Err(err) = self.open_realm() {
            tracing::error!(
                target: "realm.sync.client.session",
                path = %self.shared.path.display(),
                error = %err,
                "cannot open realm for sync"
            );
            self.deactivate_with_error(SyncErrorInfo::new(
                ProtocolErrorCode::OtherSessionError.code(),
                format!("cannot open realm for sync: {err}"),
                true,
            ));
            return;
        }
        self.activate();
    }

    fn open_realm(&mut self) -> SyncResult<()> {
        if self.realm.is_some() {
            return Ok(());
        }
        let mut config = self.shared.realm_config.clone();
        config.scheduler = None;
        config.cache = false;
        config.migration_function = None;
        config.initialization_function = None;
        config.should_compact_on_launch = None;
        let realm = Realm::open(config)?;
        self.history = ClientHistory::load(&self.shared.path, self.shared.realm_config.in_memory)?;
        self.shared.set_file_ident(self.history.file_ident());

        let id = self.shared.id;
        let handle = self.handle.clone();
        self.commits = Some(realm.observe_commits(move |event| {
            if event.origin() == CommitOrigin::Local && !event.changes().is_empty() {
                let event = event.clone();
                handle.post(move |worker| worker.with_driver(id, |driver| driver.on_local_commit(&event)));
            }
        }));
        self.realm = Some(realm);
        self.report_upload_progress();
        Ok(())
    }

    fn close_realm(&mut self) {
        self.commits = None;
        if let Some(realm) = self.realm.take() {
            if let Err(err) = realm.close() {
                tracing::warn!(target: "realm.sync.client.session", error = %err, "failed to close realm");
            }
        }
    }

    fn activate(&mut self) {
        self.shared.set_state(SessionState::WaitingForAccessToken);
        if self.shared.config.user.state() != UserState::LoggedIn {
            tracing::info!(
                target: "realm.sync.client.session",
                path = %self.shared.path.display(),
                "waiting for the user to log in"
            );
            return;
        }
        self.shared.set_state(SessionState::Active);
        if self.connection.is_some() {
            self.bind();
        } else {
            self.connect();
        }
    }

    pub fn pause(&mut self) {
        if !matches!(
            self.shared.state(),
            SessionState::Active | SessionState::WaitingForAccessToken
        ) {
            return;
        }
        self.unbind();
        self.disconnect();
        self.shared.set_state(SessionState::Paused);
    }

    pub fn resume(&mut self) {
        if !matches!(
            self.shared.state(),
            SessionState::Paused | SessionState::Inactive | SessionState::WaitingForAccessToken
        ) {
            return;
        }
        if let Err(err) = self.open_realm() {
            tracing::error!(target: "realm.sync.client.session", error = %err, "cannot reopen realm");
            return;
        }
        self.failed = false;
        self.reconnect_attempt = 0;
        self.activate();
    }

    pub fn revive(&mut self) {
        match self.shared.state() {
            SessionState::Dying => self.shared.set_state(SessionState::Active),
            SessionState::Inactive if !self.failed => self.resume(),
            _ => {}
        }
    }

    pub fn close(&mut self) {
        match self.shared.config.stop_policy {
            StopPolicy::Immediately => self.deactivate(),
            StopPolicy::LiveIndefinitely => {}
            StopPolicy::AfterChangesUploaded => {
                if self.shared.state() == SessionState::Active && self.history.has_unacknowledged() {
                    self.shared.set_state(SessionState::Dying);
                } else {
                    self.deactivate();
                }
            }
        }
    }

    pub fn force_close(&mut self) {
        self.deactivate();
        self.disconnect();
    }

    fn maybe_finish_dying(&mut self) {
        if self.shared.state() == SessionState::Dying && !self.history.has_unacknowledged() {
            tracing::debug!(target: "realm.sync.client.session", "uploads done; closing");
            self.deactivate();
        }
    }

    /// Stops syncing. The connection lingers for a while in case the
    /// session comes back.
    fn deactivate(&mut self) {
        if self.shared.state() == SessionState::Inactive {
            return;
        }
        self.unbind();
        self.shared.set_state(SessionState::Inactive);
        let linger = self.client_config.connection_linger_time;
        if linger.is_zero() || self.connection.is_none() {
            self.disconnect();
            return;
        }
        let generation = self.generation;
        let id = self.id();
        self.handle.post_after(linger, move |worker| {
            worker.with_driver(id, |driver| {
                if driver.generation == generation && driver.shared.state() == SessionState::Inactive {
                    driver.disconnect();
                }
            });
        });
    }

    fn deactivate_with_error(&mut self, info: SyncErrorInfo) {
        self.failed = true;
        self.report_error(info.clone());
        let failure = info.clone();
        self.fail_waiters(move || SyncError::Session(failure.clone()));
        if let Some(store) = self.store() {
            store.fail_waiters(&info.message);
        }
        self.disconnect();
        self.shared.set_state(SessionState::Inactive);
    }

    pub fn shutdown(&mut self) {
        self.unbind();
        self.disconnect();
        self.close_realm();
        self.shared.set_state(SessionState::Inactive);
    }

    // ---- connection ------------------------------------------------------

    fn connect_params(&self) -> ConnectParams {
        let config = &self.shared.config;
        let mut headers = config.custom_http_headers.clone();
        headers.insert(
            config.authorization_header_name.clone(),
            format!("Bearer {}", config.user.access_token()),
        );
        ConnectParams {
            path: self.shared.path.clone(),
            headers,
            connect_timeout: self.client_config.connect_timeout,
            reply_timeout: self.client_config.pong_keepalive_timeout,
            user_agent: self.client_config.user_agent.clone(),
        }
    }

    fn connect(&mut self) {
        if self.connection.is_some() || !self.is_running() {
            return;
        }
        self.shared.set_connection_state(ConnectionState::Connecting);
        match self.transport.connect(&self.connect_params()) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.generation += 1;
                self.connected_at = Some(Instant::now());
                self.shared.set_connection_state(ConnectionState::Connected);
                tracing::info!(target: "realm.sync.client", path = %self.shared.path.display(), "connected");
                self.schedule_ping();
                self.bind();
            }
            Err(err) => self.on_connection_lost(&err),
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            tracing::info!(target: "realm.sync.client", path = %self.shared.path.display(), "disconnected");
        }
        if self
            .connected_at
            .take()
            .is_some_and(|at| at.elapsed() >= self.client_config.fast_reconnect_limit)
        {
            self.reconnect_attempt = 0;
        }
        self.generation += 1;
        self.bound = false;
        self.bootstrap = None;
        self.history.rewind_sent();
        self.marks.retain(|_, purpose| !matches!(purpose, MarkPurpose::Subscription(_)));
        if let Some(store) = self.store() {
            store.revert_in_flight();
        }
        self.shared.set_connection_state(ConnectionState::Disconnected);
    }

    fn on_connection_lost(&mut self, err: &SyncError) {
        tracing::warn!(
            target: "realm.sync.client",
            path = %self.shared.path.display(),
            error = %err,
            "connection failed"
        );
        self.disconnect();
        if self.shared.config.cancel_waits_on_nonfatal_error {
            let message = err.to_string();
            self.fail_waiters(move || SyncError::transport_retryable(message.clone()));
        }
        self.schedule_reconnect(None);
    }

    fn schedule_reconnect(&mut self, server_delay: Option<Duration>) {
        if self.client_config.reconnect_mode == ReconnectMode::Testing || !self.is_running() {
            return;
        }
        let delay = server_delay.unwrap_or_else(|| {
            self.client_config
                .resumption_delay
                .delay_for_attempt(self.reconnect_attempt)
        });
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        tracing::debug!(
            target: "realm.sync.client",
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = self.reconnect_attempt,
            "scheduling reconnect"
        );
        let generation = self.generation;
        let id = self.id();
        self.handle.post_after(delay, move |worker| {
            worker.with_driver(id, |driver| {
                if driver.generation == generation {
                    driver.connect();
                }
            });
        });
    }

    pub fn reconnect_now(&mut self) {
        if self.connection.is_none() && self.is_running() {
            self.reconnect_attempt = 0;
            self.connect();
        }
    }

    fn schedule_ping(&mut self) {
        let generation = self.generation;
        let id = self.id();
        self.handle
            .post_after(self.client_config.ping_keepalive_period, move |worker| {
                worker.with_driver(id, |driver| driver.on_ping_timer(generation));
            });
    }

    fn on_ping_timer(&mut self, generation: u64) {
        if generation != self.generation || self.connection.is_none() {
            return;
        }
        if self.send(ClientMessage::Ping {
            timestamp: now_millis(),
        }) {
            self.schedule_ping();
        }
    }

    /// Sends `message` and handles the replies. Returns false when the
    /// connection was lost or replaced meanwhile.
    fn send(&mut self, message: ClientMessage) -> bool {
        let generation = self.generation;
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                self.on_internal_error(&err.into());
                return false;
            }
        };
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        tracing::trace!(target: "realm.sync.client.session", kind = message.type_code(), "sending message");
        let replies = match connection.exchange(&frame) {
            Ok(replies) => replies,
            Err(err) => {
                self.on_connection_lost(&err);
                return false;
            }
        };
        for reply in replies {
            if self.generation != generation {
                return false;
            }
            match ServerMessage::decode(&reply) {
                Ok(message) => self.handle_message(message),
                Err(err) => {
                    self.on_connection_lost(&err.into());
                    return false;
                }
            }
        }
        self.generation == generation
    }

    fn bind(&mut self) {
        let store = self.store();
        let query = store.as_ref().map(|store| {
            let active = store.active();
            (active.version(), active.queries())
        });
        self.sent_query_version = query.as_ref().map_or(0, |(version, _)| *version);
        let mode = match &self.shared.config.mode {
            SyncMode::Partition(value) => BindMode::Partition(value.clone()),
            SyncMode::Flexible => BindMode::Flexible,
        };
        let message = ClientMessage::Bind {
            session: self.id(),
            path: self.shared.path.display().to_string(),
            mode,
            access_token: self.shared.config.user.access_token(),
            file_ident: self.history.file_ident(),
            download: self.history.download(),
            query,
            protocol_version: PROTOCOL_VERSION,
        };
        tracing::debug!(
            target: "realm.sync.client.session",
            path = %self.shared.path.display(),
            file_ident = ?self.history.file_ident(),
            server_version = self.history.download().server_version,
            "binding"
        );
        self.bound = true;
        if !self.send(message) || !self.bound {
            return;
        }
        let marks: Vec<u64> = self.marks.keys().copied().collect();
        for request_ident in marks {
            if !self.send(ClientMessage::Mark {
                session: self.id(),
                request_ident,
            }) {
                return;
            }
        }
        self.send_pending_query();
        self.upload();
    }

    fn unbind(&mut self) {
        if self.bound {
            let session = self.id();
            self.send(ClientMessage::Unbind { session });
            self.bound = false;
        }
    }

    // ---- uploads ---------------------------------------------------------

    fn on_local_commit(&mut self, event: &CommitEvent) {
        if let Err(err) = self.record_commit(event) {
            self.on_internal_error(&err);
        }
    }

    fn record_commit(&mut self, event: &CommitEvent) -> SyncResult<()> {
        let operations = {
            let Some(realm) = &self.realm else {
                return Ok(());
            };
            let frozen = realm.freeze_at(event)?;
            capture_commit(&frozen, event.changes())?
        };
        if operations.is_empty() {
            return Ok(());
        }
        let version = self.history.record_local(operations, now_millis())?;
        self.history.save()?;
        tracing::debug!(target: "realm.sync.client.session", client_version = version, "recorded local changes");
        self.report_upload_progress();
        self.upload();
        Ok(())
    }

    fn upload(&mut self) {
        if !self.bound || !self.is_running() {
            return;
        }
        let (progress, changesets) = self.history.unsent();
        if changesets.is_empty() {
            return;
        }
        tracing::debug!(
            target: "realm.sync.client.session",
            changesets = changesets.len(),
            client_version = progress.client_version,
            "uploading"
        );
        self.history.mark_sent(progress.client_version);
        self.send(ClientMessage::Upload {
            session: self.id(),
            progress,
            changesets,
        });
    }

    fn report_upload_progress(&self) {
        let (uploaded, uploadable) = self.history.upload_progress();
        self.shared.progress.update(ProgressDirection::Upload, uploaded, uploadable);
    }

    pub fn add_upload_waiter(&mut self, waiter: Waiter) {
        let target = self.history.client_version();
        if self.history.acknowledged() >= target {
            waiter(Ok(()));
            return;
        }
        self.upload_waiters.push((target, waiter));
        self.upload();
    }

    fn complete_upload_waiters(&mut self) {
        let acknowledged = self.history.acknowledged();
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.upload_waiters)
            .into_iter()
            .partition(|(target, _)| *target <= acknowledged);
        self.upload_waiters = waiting;
        for (_, waiter) in done {
            waiter(Ok(()));
        }
    }

    // ---- downloads -------------------------------------------------------

    pub fn add_download_waiter(&mut self, waiter: Waiter) {
        self.add_mark(MarkPurpose::Download(waiter));
    }

    /// Registers a mark; it is sent now when bound, otherwise on the next
    /// bind.
    fn add_mark(&mut self, purpose: MarkPurpose) {
        let request_ident = self.next_mark;
        self.next_mark += 1;
        self.marks.insert(request_ident, purpose);
        if self.bound {
            self.send(ClientMessage::Mark {
                session: self.id(),
                request_ident,
            });
        }
    }

    fn on_mark(&mut self, request_ident: u64) {
        match self.marks.remove(&request_ident) {
            Some(MarkPurpose::Download(waiter)) => waiter(Ok(())),
            Some(MarkPurpose::Subscription(version)) => {
                if let Some(store) = self.store() {
                    store.set_state(version, SubscriptionSetState::Complete, None);
                }
            }
            Some(MarkPurpose::ClientReset) => self.finish_client_reset(),
            None => {}
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ident { file_ident, .. } => {
                tracing::info!(target: "realm.sync.client.session", ident = file_ident.ident, "received file identity");
                self.history.set_file_ident(file_ident);
                self.shared.set_file_ident(Some(file_ident));
                if let Err(err) = self.history.save() {
                    self.on_internal_error(&err);
                }
            }
            ServerMessage::Download {
                progress,
                downloadable_bytes,
                query_version,
                batch_state,
                changesets,
                ..
            } => {
                if let Err(err) = self.on_download(progress, downloadable_bytes, query_version, batch_state, changesets) {
                    self.on_internal_error(&err);
                }
            }
            ServerMessage::Mark { request_ident, .. } => self.on_mark(request_ident),
            ServerMessage::Error(error) => self.on_error(SyncErrorInfo::from(error)),
            ServerMessage::QueryError {
                query_version,
                message,
                ..
            } => {
                tracing::warn!(target: "realm.sync.client.session", query_version, %message, "subscription set rejected");
                if let Some(store) = self.store() {
                    store.set_state(query_version, SubscriptionSetState::Error, Some(message));
                }
            }
            ServerMessage::Pong { timestamp } => {
                tracing::trace!(target: "realm.sync.client", rtt_ms = now_millis() - timestamp, "pong");
            }
            ServerMessage::Unbound { .. } => {}
        }
    }

    fn on_download(
        &mut self,
        progress: DownloadCursor,
        downloadable_bytes: u64,
        query_version: u64,
        batch_state: BatchState,
        changesets: Vec<ServerChangeset>,
    ) -> SyncResult<()> {
        if self.history.acknowledge(progress.last_integrated_client_version) {
            self.history.save()?;
            self.report_upload_progress();
            self.complete_upload_waiters();
        }
        for changeset in &changesets {
            self.downloaded_bytes += changeset.encoded_size()?;
        }
        self.shared.progress.update(
            ProgressDirection::Download,
            self.downloaded_bytes,
            self.downloaded_bytes + downloadable_bytes,
        );
        match batch_state {
            BatchState::SteadyState => {
                self.integrate(&changesets, false)?;
                self.history.set_download(progress);
                self.history.save()?;
            }
            BatchState::MoreToCome | BatchState::LastInBatch => {
                let store = self.store();
                if let Some(store) = &store {
                    store.set_state(query_version, SubscriptionSetState::Bootstrapping, None);
                }
                let bootstrap = self.bootstrap.get_or_insert_with(|| Bootstrap {
                    query_version,
                    changesets: Vec::new(),
                });
                if bootstrap.query_version != query_version {
                    bootstrap.query_version = query_version;
                    bootstrap.changesets.clear();
                }
                bootstrap.changesets.extend(changesets);
                if batch_state == BatchState::LastInBatch {
                    let bootstrap = self.bootstrap.take().map(|b| b.changesets).unwrap_or_default();
                    self.integrate(&bootstrap, true)?;
                    self.history.set_download(progress);
                    self.history.save()?;
                    tracing::info!(
                        target: "realm.sync.client.session",
                        query_version,
                        changesets = bootstrap.len(),
                        "bootstrap applied"
                    );
                    if let Some(store) = store {
                        store.set_state(query_version, SubscriptionSetState::AwaitingMark, None);
                        if store.record(query_version).state == SubscriptionSetState::AwaitingMark {
                            self.add_mark(MarkPurpose::Subscription(query_version));
                        }
                    }
                }
            }
        }
        self.maybe_finish_dying();
        Ok(())
    }

    /// Applies server changes. Objects with unacknowledged local changes
    /// keep their local state; the server will send them back once it has
    /// integrated those changes. A bootstrap also removes local objects it
    /// does not mention.
    fn integrate(&mut self, changesets: &[ServerChangeset], bootstrap: bool) -> SyncResult<()> {
        if changesets.is_empty() && !bootstrap {
            return Ok(());
        }
        let realm = self
            .realm
            .as_ref()
            .ok_or_else(|| SyncError::wrong_state("realm is closed"))?;
        let pending = self.history.pending_keys();
        realm.write_as(CommitOrigin::Sync, |realm| {
            let applier = InstructionApplier::new(realm)?;
            let mut present = BTreeSet::new();
            for op in changesets.iter().flat_map(|c| &c.operations) {
                let id = (op.class().to_owned(), op.key().clone());
                if pending.contains(&id) {
                    continue;
                }
                if bootstrap && !op.is_erase() {
                    present.insert(id);
                }
                applier.apply(op)?;
            }
            if bootstrap {
                remove_unlisted(realm, &present, &pending)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn on_subscriptions_committed(&mut self) {
        self.send_pending_query();
    }

    fn send_pending_query(&mut self) {
        let Some(store) = self.store() else {
            return;
        };
        if !self.bound {
            return;
        }
        if let Some(record) = store.pending_after(self.sent_query_version) {
            tracing::debug!(
                target: "realm.sync.client.session",
                query_version = record.version,
                queries = record.subscriptions.len(),
                "sending subscription set"
            );
            self.sent_query_version = record.version;
            self.send(ClientMessage::Query {
                session: self.id(),
                query_version: record.version,
                queries: record.queries(),
            });
        }
    }

    // ---- errors ----------------------------------------------------------

    pub fn on_error(&mut self, info: SyncErrorInfo) {
        tracing::warn!(
            target: "realm.sync.client.session",
            path = %self.shared.path.display(),
            code = info.code,
            message = %info.message,
            fatal = info.is_fatal,
            "sync error"
        );
        if info.error_code() == Some(ProtocolErrorCode::TokenExpired) {
            self.refresh_token(info);
            return;
        }
        if info.is_client_reset_requested {
            self.client_reset(info);
            return;
        }
        if info.is_warning() {
            self.report_error(info);
            return;
        }
        if !info.is_fatal {
            let delay = info.resumption_delay;
            if self.shared.config.cancel_waits_on_nonfatal_error {
                let failure = info.clone();
                self.fail_waiters(move || SyncError::Session(failure.clone()));
            }
            self.report_error(info);
            self.disconnect();
            self.schedule_reconnect(delay);
            return;
        }
        if info.server_requests_action == ServerRequestsAction::DeleteRealm {
            self.shared
                .file_actions
                .insert(self.shared.path.clone(), FileAction::DeleteRealm);
            self.close_realm();
        }
        self.deactivate_with_error(info);
    }

    fn refresh_token(&mut self, info: SyncErrorInfo) {
        self.disconnect();
        self.shared.set_state(SessionState::WaitingForAccessToken);
        match self.shared.config.user.refresh_access_token() {
            Ok(_) => {
                tracing::info!(target: "realm.sync.client.session", "refreshed access token");
                self.shared.set_state(SessionState::Active);
                self.connect();
            }
            Err(err) => {
                let mut info = info;
                info.is_fatal = true;
                info.message = format!("{}: {err}", info.message);
                self.deactivate_with_error(info);
            }
        }
    }

    /// Reports a local failure, such as an unreadable download, and stops
    /// the session.
    fn on_internal_error(&mut self, err: &SyncError) {
        tracing::error!(
            target: "realm.sync.client.session",
            path = %self.shared.path.display(),
            error = %err,
            "sync failed"
        );
        self.deactivate_with_error(SyncErrorInfo::new(
            ProtocolErrorCode::BadChangeset.code(),
            err.to_string(),
            true,
        ));
    }

    fn report_error(&self, info: SyncErrorInfo) {
        let Some(handler) = self.shared.config.error_handler.clone() else {
            return;
        };
        let session = SyncSession::from_shared(Arc::clone(&self.shared));
        self.shared.deliver(move || handler(&session, info));
    }

    fn fail_waiters(&mut self, error: impl Fn() -> SyncError) {
        for (_, waiter) in std::mem::take(&mut self.upload_waiters) {
            waiter(Err(error()));
        }
        let marks = std::mem::take(&mut self.marks);
        for (ident, purpose) in marks {
            match purpose {
                MarkPurpose::Download(waiter) => waiter(Err(error())),
                other => {
                    self.marks.insert(ident, other);
                }
            }
        }
    }
}

/// Deletes objects of synced classes that are neither in `present` nor
/// changed locally.
fn remove_unlisted(
    realm: &Realm,
    present: &BTreeSet<(String, PrimaryKeyValue)>,
    pending: &BTreeSet<(String, PrimaryKeyValue)>,
) -> CoreResult<()> {
    let schema = realm.schema()?;
    for class in schema
        .iter()
        .filter(|c| is_syncable(c) && c.object_type != ObjectType::Asymmetric)
    {
        let results = realm.find_all(&class.name)?;
        let mut doomed = Vec::new();
        for index in 0..results.count()? {
            let object = results.get_object(index)?;
            let Some(key) = object.primary_key()?.as_ref().and_then(PrimaryKey::from_value) else {
                continue;
            };
            let id = (class.name.clone(), wire_key(&key));
            if !present.contains(&id) && !pending.contains(&id) {
                doomed.push(object);
            }
        }
        for object in doomed {
            object.delete()?;
        }
    }
    Ok(())
}
