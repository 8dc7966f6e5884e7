//! Configuration for the sync client and its sessions.

use crate::error::SyncResult;
use crate::error_info::SyncErrorInfo;
use crate::session::SyncSession;
use crate::subscriptions::MutableSubscriptionSet;
use crate::user::SyncUser;
use realmdb_core::{Realm, ThreadSafeReference};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How the client reconnects after losing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Reconnect with backoff.
    #[default]
    Normal,
    /// Never reconnect on its own; tests drive reconnects explicitly.
    Testing,
}

/// Backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ResumptionDelay {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl Default for ResumptionDelay {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl ResumptionDelay {
    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = base.min(self.max_delay.as_millis() as f64);
        if self.add_jitter {
            // Up to 25% less, so clients spread out.
            delay -= delay * 0.25 * rand::random::<f64>();
        }
        Duration::from_millis(delay.round() as u64)
    }
}

/// Settings shared by every session of a client.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Reconnect behavior.
    pub reconnect_mode: ReconnectMode,
    /// Backoff between reconnect attempts.
    pub resumption_delay: ResumptionDelay,
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// How long a connection stays open after its session deactivates.
    pub connection_linger_time: Duration,
    /// Interval between keepalive pings.
    pub ping_keepalive_period: Duration,
    /// Time allowed for a reply.
    pub pong_keepalive_timeout: Duration,
    /// Connections lost sooner than this after connecting keep backing off.
    pub fast_reconnect_limit: Duration,
    /// Name reported in logs.
    pub user_agent: String,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            reconnect_mode: ReconnectMode::Normal,
            resumption_delay: ResumptionDelay::default(),
            connect_timeout: Duration::from_secs(120),
            connection_linger_time: Duration::from_secs(30),
            ping_keepalive_period: Duration::from_secs(60),
            pong_keepalive_timeout: Duration::from_secs(120),
            fast_reconnect_limit: Duration::from_secs(60),
            user_agent: format!("realmdb/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SyncClientConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reconnect mode.
    pub fn with_reconnect_mode(mut self, mode: ReconnectMode) -> Self {
        self.reconnect_mode = mode;
        self
    }

    /// Sets the backoff between reconnect attempts.
    pub fn with_resumption_delay(mut self, delay: ResumptionDelay) -> Self {
        self.resumption_delay = delay;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the connection linger time.
    pub fn with_connection_linger_time(mut self, linger: Duration) -> Self {
        self.connection_linger_time = linger;
        self
    }

    /// Sets the keepalive ping period.
    pub fn with_ping_keepalive_period(mut self, period: Duration) -> Self {
        self.ping_keepalive_period = period;
        self
    }

    /// Sets the reply timeout.
    pub fn with_pong_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.pong_keepalive_timeout = timeout;
        self
    }

    /// Sets the fast reconnect limit.
    pub fn with_fast_reconnect_limit(mut self, limit: Duration) -> Self {
        self.fast_reconnect_limit = limit;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }
}

/// Which server data a session syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Everything in one partition.
    Partition(String),
    /// Whatever the session's subscriptions match.
    Flexible,
}

/// What closing a session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Stop at once.
    Immediately,
    /// Keep syncing until the client shuts down.
    LiveIndefinitely,
    /// Keep syncing until local changes are uploaded.
    #[default]
    AfterChangesUploaded,
}

/// How a session handles a client reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientResyncMode {
    /// Report the error and let the application back up and delete the
    /// file.
    Manual,
    /// Replace local data with the server's.
    DiscardLocal,
    /// Replace local data with the server's and reapply unsynced local
    /// changes.
    #[default]
    Recover,
    /// Recover, falling back to discarding when the server forbids
    /// recovery.
    RecoverOrDiscard,
}

/// Called with every error a session reports.
pub type ErrorHandler = Arc<dyn Fn(&SyncSession, SyncErrorInfo) + Send + Sync>;

/// Called with a frozen copy of the local data before a client reset.
pub type BeforeResetCallback = Arc<dyn Fn(&Realm) + Send + Sync>;

/// Called after a client reset with the frozen pre-reset data, the reset
/// realm, and whether local changes were recovered.
pub type AfterResetCallback = Arc<dyn Fn(&Realm, ThreadSafeReference, bool) + Send + Sync>;

/// Fills the first subscription set of a flexible sync realm.
pub type InitialSubscriptions = Arc<dyn Fn(&Realm, &mut MutableSubscriptionSet) -> SyncResult<()> + Send + Sync>;

/// Per-realm sync settings.
#[derive(Clone)]
pub struct SyncConfig {
    /// User the session authenticates as.
    pub user: Arc<dyn SyncUser>,
    /// Partition or flexible sync.
    pub mode: SyncMode,
    /// What closing does.
    pub stop_policy: StopPolicy,
    /// How client resets are handled.
    pub client_resync_mode: ClientResyncMode,
    /// Error handler.
    pub error_handler: Option<ErrorHandler>,
    /// Called before an automatic client reset.
    pub notify_before_client_reset: Option<BeforeResetCallback>,
    /// Called after an automatic client reset.
    pub notify_after_client_reset: Option<AfterResetCallback>,
    /// Whether transient errors fail pending upload and download waits.
    pub cancel_waits_on_nonfatal_error: bool,
    /// Where realms are backed up before a manual reset deletes them.
    pub recovery_directory: Option<PathBuf>,
    /// First subscriptions of a flexible sync realm.
    pub initial_subscriptions: Option<InitialSubscriptions>,
    /// Run the initial subscriptions on every open, not just the first.
    pub rerun_initial_subscriptions_on_open: bool,
    /// Extra headers sent when connecting.
    pub custom_http_headers: BTreeMap<String, String>,
    /// Header carrying the access token.
    pub authorization_header_name: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("user", &self.user)
            .field("mode", &self.mode)
            .field("stop_policy", &self.stop_policy)
            .field("client_resync_mode", &self.client_resync_mode)
            .field("cancel_waits_on_nonfatal_error", &self.cancel_waits_on_nonfatal_error)
            .finish_non_exhaustive()
    }
}

impl SyncConfig {
    /// Partition based sync of `partition`.
    pub fn partition(user: Arc<dyn SyncUser>, partition: impl Into<String>) -> Self {
        Self::new(user, SyncMode::Partition(partition.into()))
    }

    /// Flexible sync.
    pub fn flexible(user: Arc<dyn SyncUser>) -> Self {
        Self::new(user, SyncMode::Flexible)
    }

    fn new(user: Arc<dyn SyncUser>, mode: SyncMode) -> Self {
        Self {
            user,
            mode,
            stop_policy: StopPolicy::default(),
            client_resync_mode: ClientResyncMode::default(),
            error_handler: None,
            notify_before_client_reset: None,
            notify_after_client_reset: None,
            cancel_waits_on_nonfatal_error: false,
            recovery_directory: None,
            initial_subscriptions: None,
            rerun_initial_subscriptions_on_open: false,
            custom_http_headers: BTreeMap::new(),
            authorization_header_name: "Authorization".into(),
        }
    }

    /// Whether this is flexible sync.
    pub fn is_flexible(&self) -> bool {
        self.mode == SyncMode::Flexible
    }

    /// The partition value, for partition based sync.
    pub fn partition_value(&self) -> Option<&str> {
        match &self.mode {
            SyncMode::Partition(value) => Some(value),
            SyncMode::Flexible => None,
        }
    }

    /// Sets the stop policy.
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Sets the client reset mode.
    pub fn with_client_resync_mode(mut self, mode: ClientResyncMode) -> Self {
        self.client_resync_mode = mode;
        self
    }

    /// Sets the error handler.
    pub fn with_error_handler(mut self, f: impl Fn(&SyncSession, SyncErrorInfo) + Send + Sync + 'static) -> Self {
        self.error_handler = Some(Arc::new(f));
        self
    }

    /// Sets the before-reset callback.
    pub fn with_before_client_reset(mut self, f: impl Fn(&Realm) + Send + Sync + 'static) -> Self {
        self.notify_before_client_reset = Some(Arc::new(f));
        self
    }

    /// Sets the after-reset callback.
    pub fn with_after_client_reset(
        mut self,
        f: impl Fn(&Realm, ThreadSafeReference, bool) + Send + Sync + 'static,
    ) -> Self {
        self.notify_after_client_reset = Some(Arc::new(f));
        self
    }

    /// Makes transient errors fail pending waits.
    pub fn with_cancel_waits_on_nonfatal_error(mut self, cancel: bool) -> Self {
        self.cancel_waits_on_nonfatal_error = cancel;
        self
    }

    /// Sets where realms are backed up before a manual reset.
    pub fn with_recovery_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recovery_directory = Some(dir.into());
        self
    }

    /// Sets the initial subscriptions.
    pub fn with_initial_subscriptions(
        mut self,
        f: impl Fn(&Realm, &mut MutableSubscriptionSet) -> SyncResult<()> + Send + Sync + 'static,
        rerun_on_open: bool,
    ) -> Self {
        self.initial_subscriptions = Some(Arc::new(f));
        self.rerun_initial_subscriptions_on_open = rerun_on_open;
        self
    }

    /// Adds a header sent when connecting.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_http_headers.insert(name.into(), value.into());
        self
    }

    /// Sets the header carrying the access token.
    pub fn with_authorization_header_name(mut self, name: impl Into<String>) -> Self {
        self.authorization_header_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::TokenUser;

    #[test]
    fn delays_grow_and_cap() {
        let delay = ResumptionDelay::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .without_jitter();
        assert_eq!(delay.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(delay.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(delay.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn jitter_only_shortens() {
        let delay = ResumptionDelay::default().with_initial_delay(Duration::from_secs(4));
        for _ in 0..20 {
            let d = delay.delay_for_attempt(0);
            assert!(d <= Duration::from_secs(4));
            assert!(d >= Duration::from_secs(3));
        }
    }

    #[test]
    fn sync_config_builders() {
        let user = Arc::new(TokenUser::new("alice", "token"));
        let config = SyncConfig::partition(user.clone(), "tasks")
            .with_stop_policy(StopPolicy::Immediately)
            .with_client_resync_mode(ClientResyncMode::DiscardLocal)
            .with_header("X-Trace", "1");
        assert_eq!(config.partition_value(), Some("tasks"));
        assert!(!config.is_flexible());
        assert_eq!(config.stop_policy, StopPolicy::Immediately);
        assert_eq!(config.custom_http_headers["X-Trace"], "1");

        let flexible = SyncConfig::flexible(user);
        assert!(flexible.is_flexible());
        assert_eq!(flexible.partition_value(), None);
        assert_eq!(flexible.client_resync_mode, ClientResyncMode::Recover);
        assert_eq!(flexible.authorization_header_name, "Authorization");
    }
}
