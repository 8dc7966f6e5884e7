//! Shared harness: a sync manager talking to an in-process server.

#![allow(dead_code)]

use realmdb_core::{ObjectSchema, Property, PropertyType, Realm, RealmConfig, Schema};
use realmdb_sync_engine::{
    ConnectParams, ReconnectMode, SyncClientConfig, SyncConnection, SyncError, SyncManager, SyncResult,
    SyncTransport, TokenUser,
};
use realmdb_sync_server::{ServerConfig, ServerConnection, ServerError, SyncServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn schema() -> Schema {
    Schema::new(vec![
        ObjectSchema::new("Task")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("title", PropertyType::String))
            .property(Property::new("done", PropertyType::Bool)),
        ObjectSchema::new("Notice")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("text", PropertyType::String)),
    ])
}

fn to_sync(err: ServerError) -> SyncError {
    if err.is_retryable() {
        SyncError::transport_retryable(err.to_string())
    } else {
        SyncError::transport_fatal(err.to_string())
    }
}

/// Connects sessions to a [`SyncServer`] in the same process.
pub struct ServerTransport {
    server: Arc<SyncServer>,
}

impl SyncTransport for ServerTransport {
    fn connect(&self, _params: &ConnectParams) -> SyncResult<Box<dyn SyncConnection>> {
        let connection = self.server.connect().map_err(to_sync)?;
        Ok(Box::new(ServerLink {
            connection: Some(connection),
        }))
    }
}

struct ServerLink {
    connection: Option<ServerConnection>,
}

impl SyncConnection for ServerLink {
    fn exchange(&mut self, frame: &[u8]) -> SyncResult<Vec<Vec<u8>>> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| SyncError::transport_retryable("connection closed"))?;
        connection.send(frame).map_err(to_sync)
    }

    fn close(&mut self) {
        self.connection = None;
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub server: Arc<SyncServer>,
    pub manager: SyncManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_server(|config| config)
    }

    pub fn with_server(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = configure(ServerConfig::new(dir.path().join("server"), schema()));
        let server = Arc::new(SyncServer::start(config).unwrap());
        let transport = ServerTransport {
            server: Arc::clone(&server),
        };
        let manager = SyncManager::new(
            SyncClientConfig::default()
                .with_reconnect_mode(ReconnectMode::Testing)
                .with_connection_linger_time(Duration::ZERO),
            Arc::new(transport),
        )
        .unwrap();
        Self { dir, server, manager }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join("client").join(name)
    }

    pub fn realm_config(&self, name: &str) -> RealmConfig {
        std::fs::create_dir_all(self.dir.path().join("client")).unwrap();
        RealmConfig::new(self.path(name)).schema(schema(), 1)
    }

    /// A logged in user whose token refreshes from the server.
    pub fn user(&self, identity: &str) -> Arc<TokenUser> {
        let server = Arc::clone(&self.server);
        Arc::new(
            TokenUser::new(identity, self.server.issue_token(identity))
                .with_refresher(move |identity| Ok(server.issue_token(identity))),
        )
    }
}

pub fn add_task(realm: &Realm, id: i64, title: &str) {
    realm
        .write(|realm| {
            let task = realm.create_object_with_primary_key("Task", id)?;
            task.set_value("title", title)?;
            task.set_value("done", false)
        })
        .unwrap();
}

pub fn task_titles(realm: &Realm) -> Vec<String> {
    realm.refresh().unwrap();
    let results = realm.find_all("Task").unwrap().sort(&[("_id", true)]).unwrap();
    (0..results.count().unwrap())
        .map(|i| {
            results
                .get_object(i)
                .unwrap()
                .get_value("title")
                .unwrap()
                .as_str()
                .unwrap_or_default()
                .to_owned()
        })
        .collect()
}

pub fn server_count(server: &SyncServer, partition: Option<&str>, class: &'static str) -> usize {
    server
        .read(partition, move |realm| realm.find_all(class)?.count())
        .unwrap()
}

/// Polls `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
