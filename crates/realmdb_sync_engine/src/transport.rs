//! Transport layer abstraction for sync connections.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use realmdb_sync_protocol::{ClientMessage, ServerMessage};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a session passes when it opens a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Local path of the realm the connection is for.
    pub path: PathBuf,
    /// Headers, including the authorization header.
    pub headers: BTreeMap<String, String>,
    /// Time allowed to connect.
    pub connect_timeout: Duration,
    /// Time allowed for each reply.
    pub reply_timeout: Duration,
    /// Client name.
    pub user_agent: String,
}

/// Opens connections to a sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (sockets, in-process servers, mocks for testing).
pub trait SyncTransport: Send + Sync {
    /// Opens a connection.
    ///
    /// # Errors
    ///
    /// Fails with a [`SyncError::Transport`] when the server is
    /// unreachable.
    fn connect(&self, params: &ConnectParams) -> SyncResult<Box<dyn SyncConnection>>;
}

/// An open connection.
///
/// Each call sends one encoded [`ClientMessage`] frame and returns the
/// encoded [`ServerMessage`] frames the server produced in response,
/// including changes it had queued for the session.
pub trait SyncConnection: Send {
    /// Sends a frame and collects the replies.
    ///
    /// # Errors
    ///
    /// Fails with a [`SyncError::Transport`] when the connection is lost.
    fn exchange(&mut self, frame: &[u8]) -> SyncResult<Vec<Vec<u8>>>;

    /// Closes the connection.
    fn close(&mut self);
}

type Handler = Box<dyn FnMut(&ClientMessage) -> Vec<ServerMessage> + Send>;

struct MockInner {
    online: AtomicBool,
    connects: AtomicUsize,
    sent: Mutex<Vec<ClientMessage>>,
    handler: Mutex<Handler>,
}

/// A transport answering every message with a closure, for testing.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("online", &self.inner.online.load(Ordering::SeqCst))
            .field("sent", &self.inner.sent.lock().len())
            .finish()
    }
}

impl MockTransport {
    /// Creates a mock answering with `handler`.
    pub fn new(handler: impl FnMut(&ClientMessage) -> Vec<ServerMessage> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(MockInner {
                online: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                handler: Mutex::new(Box::new(handler)),
            }),
        }
    }

    /// Takes the mock server offline or back online.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Every message received so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.inner.sent.lock().clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl SyncTransport for MockTransport {
    fn connect(&self, _params: &ConnectParams) -> SyncResult<Box<dyn SyncConnection>> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("server unreachable"));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            inner: Arc::clone(&self.inner),
            open: true,
        }))
    }
}

struct MockConnection {
    inner: Arc<MockInner>,
    open: bool,
}

impl SyncConnection for MockConnection {
    fn exchange(&mut self, frame: &[u8]) -> SyncResult<Vec<Vec<u8>>> {
        if !self.open || !self.inner.online.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection lost"));
        }
        let message = ClientMessage::decode(frame)?;
        self.inner.sent.lock().push(message.clone());
        let replies = {
            let mut handler = self.inner.handler.lock();
            (*handler)(&message)
        };
        replies
            .iter()
            .map(|reply| reply.encode().map_err(SyncError::from))
            .collect()
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            path: PathBuf::from("test.realm"),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
            user_agent: "test".into(),
        }
    }

    #[test]
    fn mock_answers_with_the_handler() {
        let transport = MockTransport::new(|message| match message {
            ClientMessage::Ping { timestamp } => vec![ServerMessage::Pong { timestamp: *timestamp }],
            _ => Vec::new(),
        });
        let mut connection = transport.connect(&params()).unwrap();
        let frame = ClientMessage::Ping { timestamp: 9 }.encode().unwrap();
        let replies = connection.exchange(&frame).unwrap();
        assert_eq!(
            ServerMessage::decode(&replies[0]).unwrap(),
            ServerMessage::Pong { timestamp: 9 }
        );
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.connect_count(), 1);
    }

    #[test]
    fn offline_mock_fails_retryably() {
        let transport = MockTransport::new(|_| Vec::new());
        let mut connection = transport.connect(&params()).unwrap();
        transport.set_online(false);
        let frame = ClientMessage::Ping { timestamp: 0 }.encode().unwrap();
        assert!(connection.exchange(&frame).unwrap_err().is_retryable());
        assert!(transport.connect(&params()).is_err());

        transport.set_online(true);
        connection.close();
        assert!(connection.exchange(&frame).is_err());
    }
}
