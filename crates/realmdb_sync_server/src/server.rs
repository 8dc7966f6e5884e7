//! The sync server and its connections.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{RealmId, ServerState};
use parking_lot::Mutex;
use realmdb_core::{CoreResult, Realm};
use realmdb_sync_protocol::ProtocolErrorCode;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce(&mut ServerState) + Send>;

/// An in-process sync server.
///
/// One thread owns every server realm and handles messages one at a time.
/// Clients talk to it through [`ServerConnection`]s, exchanging encoded
/// protocol frames.
///
/// # Example
///
/// ```no_run
/// use realmdb_core::Schema;
/// use realmdb_sync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::start(ServerConfig::new("/tmp/realmdb-server", Schema::default())).unwrap();
/// let token = server.issue_token("alice");
/// let connection = server.connect().unwrap();
/// # let _ = (token, connection);
/// ```
pub struct SyncServer {
    jobs: Mutex<Sender<Job>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    validator: TokenValidator,
    root: PathBuf,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer").field("root", &self.root).finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Starts the server thread.
    ///
    /// # Errors
    ///
    /// Fails when the root directory cannot be created or the thread cannot
    /// be spawned.
    pub fn start(config: ServerConfig) -> ServerResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        let validator = TokenValidator::new(config.auth.clone());
        let root = config.root.clone();
        let (jobs, receiver) = mpsc::channel::<Job>();
        let state_validator = validator.clone();
        let thread = std::thread::Builder::new()
            .name("realmdb-sync-server".into())
            .spawn(move || run(ServerState::new(config, state_validator), &receiver))?;
        tracing::info!(target: "realm.sync.server", root = %root.display(), "sync server started");
        Ok(Self {
            jobs: Mutex::new(jobs),
            thread: Mutex::new(Some(thread)),
            validator,
            root,
        })
    }

    /// Directory holding the server realms.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Issues an access token for `identity`.
    pub fn issue_token(&self, identity: &str) -> String {
        self.validator.create_token(identity)
    }

    /// Issues a token as if issued at `issued_at` (Unix millis). Old
    /// timestamps give expired tokens.
    pub fn issue_token_at(&self, identity: &str, issued_at: u64) -> String {
        self.validator.create_token_at(identity, issued_at)
    }

    /// Opens a connection.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Unavailable`] while the server is offline.
    pub fn connect(&self) -> ServerResult<ServerConnection> {
        let jobs = self.jobs.lock().clone();
        let id = call(&jobs, ServerState::connect)??;
        Ok(ServerConnection { id, jobs })
    }

    /// Runs `f` in a write transaction on the realm for `partition` (`None`
    /// for the flexible sync realm). The change is sent to clients like any
    /// uploaded change. Returns the new server version.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or fails when the realm cannot be opened.
    pub fn write(
        &self,
        partition: Option<&str>,
        f: impl FnOnce(&Realm) -> CoreResult<()> + Send + 'static,
    ) -> ServerResult<u64> {
        let id = RealmId::new(partition);
        self.call(move |state| state.write(&id, f))?
    }

    /// Runs `f` on the realm for `partition`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or fails when the realm cannot be opened.
    pub fn read<T: Send + 'static>(
        &self,
        partition: Option<&str>,
        f: impl FnOnce(&Realm) -> CoreResult<T> + Send + 'static,
    ) -> ServerResult<T> {
        let id = RealmId::new(partition);
        self.call(move |state| -> ServerResult<T> { Ok(f(&state.realm(&id)?.realm)?) })?
    }

    /// Newest server version of the realm for `partition`.
    ///
    /// # Errors
    ///
    /// Fails when the realm cannot be opened.
    pub fn version(&self, partition: Option<&str>) -> ServerResult<u64> {
        let id = RealmId::new(partition);
        self.call(move |state| state.realm(&id).map(|r| r.history.version()))?
    }

    /// Takes the server offline or back online. Offline, every message and
    /// connection attempt fails with [`ServerError::Unavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] after shutdown.
    pub fn set_offline(&self, offline: bool) -> ServerResult<()> {
        tracing::info!(target: "realm.sync.server", offline, "changing availability");
        self.call(move |state| state.offline = offline)
    }

    /// Forgets the history and client files of a realm, as if it had been
    /// restored from a backup. Clients must reset on their next message.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] after shutdown.
    pub fn reset_realm(&self, partition: Option<&str>) -> ServerResult<()> {
        let id = RealmId::new(partition);
        self.call(move |state| state.reset_realm(&id))
    }

    /// Answers the next message that can carry `code` with that error.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] after shutdown.
    pub fn inject_error(&self, code: ProtocolErrorCode) -> ServerResult<()> {
        self.call(move |state| state.inject_error(code))
    }

    /// Stops the server thread. Later calls fail with
    /// [`ServerError::Stopped`].
    pub fn shutdown(&self) {
        let _ = self.jobs.lock().send(Box::new(|state| state.stopped = true));
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(target: "realm.sync.server", "server thread panicked");
            }
        }
    }

    fn call<T: Send + 'static>(&self, f: impl FnOnce(&mut ServerState) -> T + Send + 'static) -> ServerResult<T> {
        let jobs = self.jobs.lock().clone();
        call(&jobs, f)
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A client connection to a [`SyncServer`]. Dropping it closes the
/// connection and unbinds its sessions.
#[derive(Debug)]
pub struct ServerConnection {
    id: u64,
    jobs: Sender<Job>,
}

impl ServerConnection {
    /// Connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends one encoded client message and returns the encoded replies.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Unavailable`] while the server is offline and
    /// [`ServerError::Stopped`] after shutdown.
    pub fn send(&self, frame: &[u8]) -> ServerResult<Vec<Vec<u8>>> {
        let frame = frame.to_vec();
        let id = self.id;
        call(&self.jobs, move |state| state.handle(id, &frame))?
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        let id = self.id;
        let _ = self.jobs.send(Box::new(move |state| state.disconnect(id)));
    }
}

fn call<T: Send + 'static>(
    jobs: &Sender<Job>,
    f: impl FnOnce(&mut ServerState) -> T + Send + 'static,
) -> ServerResult<T> {
    let (reply, result) = mpsc::channel();
    jobs.send(Box::new(move |state| {
        let _ = reply.send(f(state));
    }))
    .map_err(|_| ServerError::Stopped)?;
    result.recv().map_err(|_| ServerError::Stopped)
}

fn run(mut state: ServerState, jobs: &Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        job(&mut state);
        if state.stopped {
            break;
        }
    }
    tracing::info!(target: "realm.sync.server", "sync server stopped");
}
