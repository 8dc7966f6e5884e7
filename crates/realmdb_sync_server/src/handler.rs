//! Message handling.
//!
//! Everything here runs on the server thread, which owns the server realms.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::history::ServerHistory;
use parking_lot::Mutex;
use realmdb_core::{
    CommitOrigin, CoreError, CoreResult, ObjKey, Object, ObjectType, Query, Realm, RealmConfig,
    Results, Schema,
};
use realmdb_sync_protocol::instructions::{
    capture_commit, is_syncable, key_value, upsert_for, InstructionApplier,
};
use realmdb_sync_protocol::{
    BatchState, BindMode, Changeset, ClientMessage, CompensatingWrite, DownloadCursor,
    ErrorMessage, FileIdent, PrimaryKeyValue, ProtocolErrorCode, QuerySpec, ServerChangeset,
    ServerMessage, SyncOperation, UploadCursor, PROTOCOL_VERSION,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const TARGET: &str = "realm.sync.server";

/// Which server realm a session works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RealmId {
    Partition(String),
    Flexible,
}

impl RealmId {
    pub fn new(partition: Option<&str>) -> Self {
        partition.map_or(Self::Flexible, |p| Self::Partition(p.to_owned()))
    }

    fn file_name(&self) -> String {
        match self {
            Self::Partition(value) => {
                let hex: String = value.bytes().map(|b| format!("{b:02x}")).collect();
                format!("partition-{hex}.realm")
            }
            Self::Flexible => "flexible.realm".to_owned(),
        }
    }
}

impl From<&BindMode> for RealmId {
    fn from(mode: &BindMode) -> Self {
        match mode {
            BindMode::Partition(value) => Self::Partition(value.clone()),
            BindMode::Flexible => Self::Flexible,
        }
    }
}

pub(crate) struct ServerRealm {
    pub realm: Realm,
    pub history: ServerHistory,
}

#[derive(Debug)]
struct Session {
    realm: RealmId,
    file_ident: FileIdent,
    download_version: u64,
    query_version: u64,
    queries: Vec<QuerySpec>,
    flexible: bool,
}

#[derive(Debug, Default)]
struct Connection {
    sessions: BTreeMap<u64, Session>,
}

/// Fields of a bind message.
struct BindRequest {
    session: u64,
    mode: BindMode,
    access_token: String,
    file_ident: Option<FileIdent>,
    download: DownloadCursor,
    query: Option<(u64, Vec<QuerySpec>)>,
    protocol_version: u16,
}

/// State owned by the server thread.
pub(crate) struct ServerState {
    config: ServerConfig,
    validator: TokenValidator,
    realms: HashMap<RealmId, ServerRealm>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    injected: VecDeque<ProtocolErrorCode>,
    pub offline: bool,
    pub stopped: bool,
}

impl ServerState {
    pub fn new(config: ServerConfig, validator: TokenValidator) -> Self {
        Self {
            config,
            validator,
            realms: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 1,
            injected: VecDeque::new(),
            offline: false,
            stopped: false,
        }
    }

    pub fn connect(&mut self) -> ServerResult<u64> {
        if self.offline {
            return Err(ServerError::Unavailable);
        }
        let id = self.next_connection;
        self.next_connection += 1;
        self.connections.insert(id, Connection::default());
        tracing::debug!(target: TARGET, connection = id, "connection opened");
        Ok(id)
    }

    pub fn disconnect(&mut self, id: u64) {
        if self.connections.remove(&id).is_some() {
            tracing::debug!(target: TARGET, connection = id, "connection closed");
        }
    }

    pub fn inject_error(&mut self, code: ProtocolErrorCode) {
        self.injected.push_back(code);
    }

    /// Forgets the history and client files of a realm. Its data stays.
    pub fn reset_realm(&mut self, id: &RealmId) {
        if let Some(realm) = self.realms.get_mut(id) {
            realm.history = ServerHistory::new();
            tracing::info!(target: TARGET, realm = ?id, "server history reset");
        }
    }

    /// The server realm for `id`, opened on first use.
    pub fn realm(&mut self, id: &RealmId) -> ServerResult<&mut ServerRealm> {
        realm_in(&mut self.realms, &self.config, id)
    }

    /// Runs a local write on a server realm and records it in the history.
    /// Returns the newest server version.
    pub fn write(&mut self, id: &RealmId, f: impl FnOnce(&Realm) -> CoreResult<()>) -> ServerResult<u64> {
        let realm = self.realm(id)?;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = realm.realm.observe_commits(move |event| {
            if event.origin() == CommitOrigin::Local && !event.changes().is_empty() {
                sink.lock().push(event.clone());
            }
        });
        let result = realm.realm.write(f);
        drop(subscription);
        result?;

        let events = std::mem::take(&mut *events.lock());
        for event in &events {
            let frozen = realm.realm.freeze_at(event)?;
            let operations = capture_commit(&frozen, event.changes())?;
            if !operations.is_empty() {
                realm.history.append(0, timestamp(), operations);
            }
        }
        Ok(realm.history.version())
    }

    /// Handles one frame and returns the encoded replies.
    pub fn handle(&mut self, conn: u64, frame: &[u8]) -> ServerResult<Vec<Vec<u8>>> {
        if self.offline {
            return Err(ServerError::Unavailable);
        }
        if !self.connections.contains_key(&conn) {
            return Err(ServerError::UnknownConnection(conn));
        }
        let mut out = Vec::new();
        match ClientMessage::decode(frame) {
            Ok(message) => {
                tracing::trace!(
                    target: TARGET,
                    connection = conn,
                    kind = message.type_code(),
                    "received message"
                );
                if let Some(code) = self.take_injected(&message) {
                    let session = message.session().filter(|_| code.is_session_level());
                    self.fail(conn, ErrorMessage::new(session, code, "injected error"), &mut out);
                } else {
                    self.dispatch(conn, message, &mut out)?;
                }
            }
            Err(err) => {
                let error = ErrorMessage::new(None, ProtocolErrorCode::BadSyntax, err.to_string());
                self.fail(conn, error, &mut out);
            }
        }
        out.iter()
            .map(|message| message.encode().map_err(ServerError::from))
            .collect()
    }

    fn take_injected(&mut self, message: &ClientMessage) -> Option<ProtocolErrorCode> {
        let code = *self.injected.front()?;
        if code.is_session_level() && message.session().is_none() {
            return None;
        }
        self.injected.pop_front()
    }

    /// Reports `error`. Anything but a warning ends the session, or every
    /// session of the connection for connection level errors.
    fn fail(&mut self, conn: u64, error: ErrorMessage, out: &mut Vec<ServerMessage>) {
        tracing::debug!(
            target: TARGET,
            connection = conn,
            session = ?error.session,
            code = error.code,
            message = %error.message,
            "sending error"
        );
        if error.is_fatal() || error.try_again {
            if let Some(connection) = self.connections.get_mut(&conn) {
                match error.session {
                    Some(session) => {
                        connection.sessions.remove(&session);
                    }
                    None => connection.sessions.clear(),
                }
            }
        }
        out.push(ServerMessage::Error(error));
    }

    fn session_is_stale(&self, conn: u64, session: u64) -> bool {
        let Some(bound) = self.connections.get(&conn).and_then(|c| c.sessions.get(&session)) else {
            return false;
        };
        self.realms
            .get(&bound.realm)
            .map_or(true, |realm| realm.history.client(bound.file_ident).is_none())
    }

    fn dispatch(&mut self, conn: u64, message: ClientMessage, out: &mut Vec<ServerMessage>) -> ServerResult<()> {
        if let Some(session) = message.session() {
            if !matches!(message, ClientMessage::Bind { .. }) && self.session_is_stale(conn, session) {
                let error = ErrorMessage::new(
                    Some(session),
                    ProtocolErrorCode::BadClientFileIdent,
                    "client file is no longer known to the server",
                );
                self.fail(conn, error, out);
                return Ok(());
            }
        }

        let mut ack = None;
        match message {
            ClientMessage::Bind {
                session,
                mode,
                access_token,
                file_ident,
                download,
                query,
                protocol_version,
                ..
            } => self.bind(
                conn,
                BindRequest {
                    session,
                    mode,
                    access_token,
                    file_ident,
                    download,
                    query,
                    protocol_version,
                },
                out,
            )?,
            ClientMessage::Upload {
                session,
                progress,
                changesets,
            } => {
                self.upload(conn, session, progress, changesets, out)?;
                ack = Some(session);
            }
            ClientMessage::Query {
                session,
                query_version,
                queries,
            } => self.query(conn, session, query_version, queries, out)?,
            ClientMessage::Mark {
                session,
                request_ident,
            } => {
                self.flush(conn, None, out)?;
                out.push(ServerMessage::Mark {
                    session,
                    request_ident,
                });
            }
            ClientMessage::Ping { timestamp } => {
                self.flush(conn, None, out)?;
                out.push(ServerMessage::Pong { timestamp });
            }
            ClientMessage::Unbind { session } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.sessions.remove(&session);
                }
                out.push(ServerMessage::Unbound { session });
            }
        }
        self.flush(conn, ack, out)
    }

    fn bind(&mut self, conn: u64, request: BindRequest, out: &mut Vec<ServerMessage>) -> ServerResult<()> {
        let session = request.session;
        if request.protocol_version != PROTOCOL_VERSION {
            let error = ErrorMessage::new(
                None,
                ProtocolErrorCode::WrongProtocolVersion,
                format!(
                    "server speaks protocol {PROTOCOL_VERSION}, client sent {}",
                    request.protocol_version
                ),
            );
            self.fail(conn, error, out);
            return Ok(());
        }
        let bound_count = self
            .connections
            .get(&conn)
            .map_or(0, |c| c.sessions.len());
        if self
            .connections
            .get(&conn)
            .is_some_and(|c| c.sessions.contains_key(&session))
        {
            let error = ErrorMessage::new(
                None,
                ProtocolErrorCode::ReuseOfSessionIdent,
                format!("session {session} is already bound"),
            );
            self.fail(conn, error, out);
            return Ok(());
        }
        if bound_count >= self.config.max_sessions_per_connection {
            let error = ErrorMessage::new(
                Some(session),
                ProtocolErrorCode::TooManySessions,
                "too many sessions on this connection",
            );
            self.fail(conn, error, out);
            return Ok(());
        }
        let identity = match self.validator.validate(&request.access_token) {
            Ok(identity) => identity,
            Err(ServerError::TokenExpired) => {
                let error = ErrorMessage::new(
                    Some(session),
                    ProtocolErrorCode::TokenExpired,
                    "access token expired",
                );
                self.fail(conn, error, out);
                return Ok(());
            }
            Err(err) => {
                let error = ErrorMessage::new(
                    Some(session),
                    ProtocolErrorCode::BadAuthentication,
                    err.to_string(),
                );
                self.fail(conn, error, out);
                return Ok(());
            }
        };

        match self.open_session(&request, &identity, out)? {
            Ok(bound) => {
                tracing::debug!(
                    target: TARGET,
                    connection = conn,
                    session,
                    file_ident = bound.file_ident.ident,
                    identity = %identity,
                    "session bound"
                );
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.sessions.insert(session, bound);
                }
            }
            Err(error) => self.fail(conn, error, out),
        }
        Ok(())
    }

    fn open_session(
        &mut self,
        request: &BindRequest,
        identity: &str,
        out: &mut Vec<ServerMessage>,
    ) -> ServerResult<Result<Session, ErrorMessage>> {
        let session = request.session;
        let id = RealmId::from(&request.mode);
        let batch_size = self.config.bootstrap_batch_size;
        let realm = realm_in(&mut self.realms, &self.config, &id)?;

        let file_ident = match request.file_ident {
            None => {
                let ident = realm.history.allocate(identity);
                out.push(ServerMessage::Ident {
                    session,
                    file_ident: ident,
                });
                ident
            }
            Some(ident) => match realm.history.client(ident) {
                Some(client) if client.identity == identity => ident,
                Some(_) => {
                    return Ok(Err(ErrorMessage::new(
                        Some(session),
                        ProtocolErrorCode::UserMismatch,
                        "client file belongs to another user",
                    )));
                }
                None => {
                    return Ok(Err(ErrorMessage::new(
                        Some(session),
                        ProtocolErrorCode::BadClientFileIdent,
                        format!("unknown client file {}", ident.ident),
                    )));
                }
            },
        };

        let version = realm.history.version();
        if request.download.server_version > version {
            return Ok(Err(ErrorMessage::new(
                Some(session),
                ProtocolErrorCode::BadServerVersion,
                format!(
                    "client claims server version {}, server is at {version}",
                    request.download.server_version
                ),
            )));
        }

        let (query_version, queries) = request.query.clone().unwrap_or_default();
        let flexible = matches!(request.mode, BindMode::Flexible);
        if flexible {
            if let Some(message) = invalid_query(&realm.realm, &queries) {
                out.push(ServerMessage::QueryError {
                    session,
                    query_version,
                    message,
                });
            }
        }
        let mut bound = Session {
            realm: id,
            file_ident,
            download_version: request.download.server_version,
            query_version,
            queries,
            flexible,
        };
        if request.download.server_version == 0 {
            let operations = state_operations(&realm.realm, &bound)?;
            let progress = DownloadCursor {
                server_version: version,
                last_integrated_client_version: realm.history.last_integrated(file_ident.ident),
            };
            push_bootstrap(out, session, progress, query_version, operations, batch_size)?;
            bound.download_version = version;
        }
        Ok(Ok(bound))
    }

    fn upload(
        &mut self,
        conn: u64,
        session: u64,
        progress: UploadCursor,
        changesets: Vec<Changeset>,
        out: &mut Vec<ServerMessage>,
    ) -> ServerResult<()> {
        let Some(bound) = self.connections.get(&conn).and_then(|c| c.sessions.get(&session)) else {
            let error = ErrorMessage::new(
                None,
                ProtocolErrorCode::BadSessionIdent,
                format!("upload for unbound session {session}"),
            );
            self.fail(conn, error, out);
            return Ok(());
        };
        let id = bound.realm.clone();
        let ident = bound.file_ident.ident;
        let flexible = bound.flexible;
        let queries = bound.queries.clone();
        let query_version = bound.query_version;
        let download_version = bound.download_version;
        let read_only = &self.config.read_only_classes;
        let realm = realm_in(&mut self.realms, &self.config, &id)?;

        let mut rejected = Vec::new();
        for changeset in changesets {
            if changeset.client_version <= realm.history.last_integrated(ident) {
                continue;
            }
            let accepted = if flexible {
                integrate_checked(&realm.realm, changeset.operations, &queries, read_only, &mut rejected)?
            } else {
                realm.realm.write_as(CommitOrigin::Sync, |r| {
                    InstructionApplier::new(r)?.apply_all(&changeset.operations)
                })?;
                changeset.operations
            };
            if !accepted.is_empty() {
                let version = realm.history.append(ident, changeset.origin_timestamp, accepted);
                tracing::debug!(target: TARGET, file_ident = ident, server_version = version, "integrated changeset");
            }
            realm.history.record_integrated(ident, changeset.client_version);
        }
        realm.history.record_integrated(ident, progress.client_version);

        if rejected.is_empty() {
            return Ok(());
        }
        let schema = realm.realm.schema()?;
        let mut writes = Vec::with_capacity(rejected.len());
        let mut corrective = Vec::with_capacity(rejected.len());
        for (op, reason) in rejected {
            corrective.push(current_state(&realm.realm, &schema, op.class(), op.key(), &queries)?);
            writes.push(CompensatingWrite {
                reason,
                object_name: op.class().to_owned(),
                primary_key: op.key().clone(),
            });
        }
        tracing::info!(target: TARGET, file_ident = ident, rejected = writes.len(), "compensating writes");
        let progress = DownloadCursor {
            server_version: download_version,
            last_integrated_client_version: realm.history.last_integrated(ident),
        };
        let count = writes.len();
        out.push(ServerMessage::Error(
            ErrorMessage::new(
                Some(session),
                ProtocolErrorCode::CompensatingWrite,
                format!("{count} write(s) were not allowed and have been reverted"),
            )
            .with_compensating_writes(writes),
        ));
        out.push(ServerMessage::Download {
            session,
            progress,
            downloadable_bytes: 0,
            query_version,
            batch_state: BatchState::SteadyState,
            changesets: vec![ServerChangeset {
                server_version: download_version,
                origin_file_ident: 0,
                origin_timestamp: timestamp(),
                operations: corrective,
            }],
        });
        Ok(())
    }

    fn query(
        &mut self,
        conn: u64,
        session: u64,
        query_version: u64,
        queries: Vec<QuerySpec>,
        out: &mut Vec<ServerMessage>,
    ) -> ServerResult<()> {
        let Some(id) = self
            .connections
            .get(&conn)
            .and_then(|c| c.sessions.get(&session))
            .map(|s| s.realm.clone())
        else {
            let error = ErrorMessage::new(
                None,
                ProtocolErrorCode::BadSessionIdent,
                format!("query for unbound session {session}"),
            );
            self.fail(conn, error, out);
            return Ok(());
        };
        let batch_size = self.config.bootstrap_batch_size;
        let realm = realm_in(&mut self.realms, &self.config, &id)?;
        if let Some(message) = invalid_query(&realm.realm, &queries) {
            tracing::debug!(target: TARGET, session, query_version, %message, "rejected query");
            out.push(ServerMessage::QueryError {
                session,
                query_version,
                message,
            });
            return Ok(());
        }
        let Some(bound) = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.sessions.get_mut(&session))
        else {
            return Ok(());
        };
        bound.queries = queries;
        bound.query_version = query_version;
        let version = realm.history.version();
        let operations = state_operations(&realm.realm, bound)?;
        let progress = DownloadCursor {
            server_version: version,
            last_integrated_client_version: realm.history.last_integrated(bound.file_ident.ident),
        };
        push_bootstrap(out, session, progress, query_version, operations, batch_size)?;
        bound.download_version = version;
        Ok(())
    }

    /// Sends every session of `conn` the changes it has not seen. `ack`
    /// names a session that gets a download even when there is nothing new.
    fn flush(&mut self, conn: u64, ack: Option<u64>, out: &mut Vec<ServerMessage>) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return Ok(());
        };
        for (&session, bound) in &mut connection.sessions {
            let realm = realm_in(&mut self.realms, &self.config, &bound.realm)?;
            let realm: &ServerRealm = realm;
            let version = realm.history.version();
            if version <= bound.download_version && ack != Some(session) {
                continue;
            }
            let mut changesets = Vec::new();
            for changeset in realm.history.since(bound.download_version) {
                if changeset.origin_file_ident == bound.file_ident.ident {
                    continue;
                }
                let operations = visible_operations(&realm.realm, bound, &changeset.operations)?;
                if !operations.is_empty() {
                    changesets.push(ServerChangeset {
                        server_version: changeset.server_version,
                        origin_file_ident: changeset.origin_file_ident,
                        origin_timestamp: changeset.origin_timestamp,
                        operations,
                    });
                }
            }
            bound.download_version = bound.download_version.max(version);
            if changesets.is_empty() && ack != Some(session) {
                continue;
            }
            out.push(ServerMessage::Download {
                session,
                progress: DownloadCursor {
                    server_version: bound.download_version,
                    last_integrated_client_version: realm.history.last_integrated(bound.file_ident.ident),
                },
                downloadable_bytes: 0,
                query_version: bound.query_version,
                batch_state: BatchState::SteadyState,
                changesets,
            });
        }
        Ok(())
    }
}

fn realm_in<'a>(
    realms: &'a mut HashMap<RealmId, ServerRealm>,
    config: &ServerConfig,
    id: &RealmId,
) -> ServerResult<&'a mut ServerRealm> {
    match realms.entry(id.clone()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let path = config.root.join(id.file_name());
            let realm = Realm::open(
                RealmConfig::new(&path).schema(config.schema.clone(), config.schema_version),
            )?;
            tracing::info!(target: TARGET, path = %path.display(), "opened server realm");
            Ok(entry.insert(ServerRealm {
                realm,
                history: ServerHistory::new(),
            }))
        }
    }
}

pub(crate) fn timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn invalid_query(realm: &Realm, queries: &[QuerySpec]) -> Option<String> {
    queries.iter().find_map(|entry| {
        Query::parse(realm, &entry.class, &entry.query, &[])
            .err()
            .map(|err| format!("invalid query for class '{}': {err}", entry.class))
    })
}

fn is_asymmetric(schema: &Schema, class: &str) -> bool {
    schema
        .find(class)
        .is_some_and(|c| c.object_type == ObjectType::Asymmetric)
}

fn matches_subscription(realm: &Realm, object: &Object, class: &str, queries: &[QuerySpec]) -> CoreResult<bool> {
    for entry in queries.iter().filter(|q| q.class == class) {
        let Ok(query) = Query::parse(realm, class, &entry.query, &[]) else {
            continue;
        };
        if query.find_all().find_object(object)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Applies each operation in its own write and keeps those the session's
/// permissions and subscriptions allow.
fn integrate_checked(
    realm: &Realm,
    operations: Vec<SyncOperation>,
    queries: &[QuerySpec],
    read_only: &BTreeSet<String>,
    rejected: &mut Vec<(SyncOperation, String)>,
) -> ServerResult<Vec<SyncOperation>> {
    let schema = realm.schema()?;
    let mut accepted = Vec::with_capacity(operations.len());
    for op in operations {
        let class = op.class().to_owned();
        if schema.find(&class).is_none() {
            continue;
        }
        let asymmetric = is_asymmetric(&schema, &class);
        if read_only.contains(&class) {
            rejected.push((op, format!("class '{class}' is read-only")));
            continue;
        }
        if !asymmetric && !queries.iter().any(|q| q.class == class) {
            rejected.push((op, format!("no subscription covers class '{class}'")));
            continue;
        }

        let mut outside = false;
        let result = realm.write_as(CommitOrigin::Sync, |r| {
            InstructionApplier::new(r)?.apply(&op)?;
            if let SyncOperation::Upsert { key, .. } = &op {
                if !asymmetric {
                    let visible = match r.find_with_primary_key(&class, key_value(key))? {
                        Some(object) => matches_subscription(r, &object, &class, queries)?,
                        None => false,
                    };
                    if !visible {
                        outside = true;
                        return Err(CoreError::illegal("write outside of the subscriptions"));
                    }
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => accepted.push(op),
            Err(_) if outside => {
                rejected.push((op, format!("object is outside the subscriptions for class '{class}'")));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(accepted)
}

/// The operation that brings a client back to the server's view of one
/// object.
fn current_state(
    realm: &Realm,
    schema: &Schema,
    class: &str,
    key: &PrimaryKeyValue,
    queries: &[QuerySpec],
) -> ServerResult<SyncOperation> {
    if schema.find(class).is_some() && !is_asymmetric(schema, class) {
        if let Some(object) = realm.find_with_primary_key(class, key_value(key))? {
            if matches_subscription(realm, &object, class, queries)? {
                if let Some(op) = upsert_for(&object, schema)? {
                    return Ok(op);
                }
            }
        }
    }
    Ok(SyncOperation::erase(class, key.clone()))
}

/// Operations of a history entry as `session` may see them.
fn visible_operations(realm: &Realm, session: &Session, operations: &[SyncOperation]) -> ServerResult<Vec<SyncOperation>> {
    let schema = realm.schema()?;
    let mut visible = Vec::new();
    for op in operations {
        let Some(class) = schema.find(op.class()) else {
            continue;
        };
        if class.object_type == ObjectType::Asymmetric {
            continue;
        }
        if !session.flexible {
            visible.push(op.clone());
            continue;
        }
        if !session.queries.iter().any(|q| q.class == class.name) {
            continue;
        }
        match op {
            SyncOperation::Erase { .. } => visible.push(op.clone()),
            SyncOperation::Upsert { class, key, .. } => {
                match realm.find_with_primary_key(class, key_value(key))? {
                    Some(object) if matches_subscription(realm, &object, class, &session.queries)? => {
                        visible.extend(upsert_for(&object, &schema)?);
                    }
                    Some(_) => visible.push(SyncOperation::erase(class.clone(), key.clone())),
                    None => {}
                }
            }
        }
    }
    Ok(visible)
}

/// Every object `session` may see, as upserts.
fn state_operations(realm: &Realm, session: &Session) -> ServerResult<Vec<SyncOperation>> {
    let schema = realm.schema()?;
    let mut operations = Vec::new();
    for class in schema.iter() {
        if !is_syncable(class) || class.object_type == ObjectType::Asymmetric {
            continue;
        }
        let mut seen = BTreeSet::new();
        if session.flexible {
            for entry in session.queries.iter().filter(|q| q.class == class.name) {
                let Ok(query) = Query::parse(realm, &class.name, &entry.query, &[]) else {
                    continue;
                };
                collect_upserts(&query.find_all(), &schema, &mut seen, &mut operations)?;
            }
        } else {
            collect_upserts(&realm.find_all(&class.name)?, &schema, &mut seen, &mut operations)?;
        }
    }
    Ok(operations)
}

fn collect_upserts(
    results: &Results,
    schema: &Schema,
    seen: &mut BTreeSet<ObjKey>,
    operations: &mut Vec<SyncOperation>,
) -> CoreResult<()> {
    for index in 0..results.count()? {
        let object = results.get_object(index)?;
        if seen.insert(object.key()) {
            operations.extend(upsert_for(&object, schema)?);
        }
    }
    Ok(())
}

/// Sends `operations` as a bootstrap in batches.
fn push_bootstrap(
    out: &mut Vec<ServerMessage>,
    session: u64,
    progress: DownloadCursor,
    query_version: u64,
    operations: Vec<SyncOperation>,
    batch_size: usize,
) -> ServerResult<()> {
    let origin_timestamp = timestamp();
    let batches: Vec<Vec<SyncOperation>> = if operations.is_empty() {
        vec![Vec::new()]
    } else {
        operations.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
    };
    let changesets: Vec<ServerChangeset> = batches
        .into_iter()
        .map(|operations| ServerChangeset {
            server_version: progress.server_version,
            origin_file_ident: 0,
            origin_timestamp,
            operations,
        })
        .collect();
    let sizes = changesets
        .iter()
        .map(ServerChangeset::encoded_size)
        .collect::<Result<Vec<_>, _>>()?;
    let mut remaining: u64 = sizes.iter().sum();
    let last = changesets.len() - 1;
    for (index, (changeset, size)) in changesets.into_iter().zip(sizes).enumerate() {
        remaining -= size;
        out.push(ServerMessage::Download {
            session,
            progress,
            downloadable_bytes: remaining,
            query_version,
            batch_state: if index == last {
                BatchState::LastInBatch
            } else {
                BatchState::MoreToCome
            },
            changesets: vec![changeset],
        });
    }
    tracing::debug!(target: TARGET, session, query_version, batches = last + 1, "sent bootstrap");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realm_files_are_named_by_partition() {
        assert_eq!(RealmId::new(Some("ab")).file_name(), "partition-6162.realm");
        assert_eq!(RealmId::new(None).file_name(), "flexible.realm");
        assert_eq!(
            RealmId::from(&BindMode::Partition("x".into())),
            RealmId::Partition("x".into())
        );
    }

    #[test]
    fn bootstrap_batches() {
        let mut out = Vec::new();
        let operations: Vec<_> = (0..5)
            .map(|k| SyncOperation::erase("Task", PrimaryKeyValue::Int(k)))
            .collect();
        push_bootstrap(&mut out, 1, DownloadCursor::default(), 2, operations, 2).unwrap();
        let states: Vec<_> = out
            .iter()
            .map(|m| match m {
                ServerMessage::Download {
                    batch_state,
                    downloadable_bytes,
                    ..
                } => (*batch_state, *downloadable_bytes),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(states.len(), 3);
        assert_eq!(states[0].0, BatchState::MoreToCome);
        assert!(states[0].1 > states[1].1);
        assert_eq!(states[2], (BatchState::LastInBatch, 0));

        let mut empty = Vec::new();
        push_bootstrap(&mut empty, 1, DownloadCursor::default(), 0, Vec::new(), 10).unwrap();
        assert_eq!(empty.len(), 1);
    }
}
