//! Server configuration.

use crate::auth::AuthConfig;
use realmdb_core::Schema;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the server realms.
    pub root: PathBuf,
    /// Schema of every server realm.
    pub schema: Schema,
    /// Schema version of every server realm.
    pub schema_version: u64,
    /// Token signing.
    pub auth: AuthConfig,
    /// Classes clients may read but not write (flexible sync).
    pub read_only_classes: BTreeSet<String>,
    /// Operations per bootstrap download message.
    pub bootstrap_batch_size: usize,
    /// Maximum sessions bound on one connection.
    pub max_sessions_per_connection: usize,
}

impl ServerConfig {
    /// Creates a configuration storing realms under `root`.
    pub fn new(root: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            root: root.into(),
            schema,
            schema_version: 1,
            auth: AuthConfig::new(b"realmdb-development-secret".to_vec()),
            read_only_classes: BTreeSet::new(),
            bootstrap_batch_size: 100,
            max_sessions_per_connection: 256,
        }
    }

    /// Sets the token signing secret.
    #[must_use]
    pub fn with_auth_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.auth.secret = secret.into();
        self
    }

    /// Sets the token lifetime.
    #[must_use]
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.auth.token_expiry = expiry;
        self
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    /// Makes `class` read-only for clients.
    #[must_use]
    pub fn with_read_only_class(mut self, class: impl Into<String>) -> Self {
        self.read_only_classes.insert(class.into());
        self
    }

    /// Sets the number of operations per bootstrap message.
    #[must_use]
    pub fn with_bootstrap_batch_size(mut self, size: usize) -> Self {
        self.bootstrap_batch_size = size.max(1);
        self
    }

    /// Sets the session limit per connection.
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions_per_connection = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::new("/tmp/server", Schema::default());
        assert_eq!(config.bootstrap_batch_size, 100);
        assert_eq!(config.schema_version, 1);
        assert!(config.read_only_classes.is_empty());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("/tmp/server", Schema::default())
            .with_auth_secret(vec![1, 2, 3, 4])
            .with_token_expiry(Duration::from_secs(5))
            .with_read_only_class("Catalog")
            .with_bootstrap_batch_size(0)
            .with_max_sessions(2);

        assert_eq!(config.auth.secret, vec![1, 2, 3, 4]);
        assert_eq!(config.auth.token_expiry, Duration::from_secs(5));
        assert!(config.read_only_classes.contains("Catalog"));
        assert_eq!(config.bootstrap_batch_size, 1);
        assert_eq!(config.max_sessions_per_connection, 2);
    }
}
