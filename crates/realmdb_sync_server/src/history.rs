//! Server-side history of one realm.

use realmdb_sync_protocol::{FileIdent, ServerChangeset, SyncOperation};
use std::collections::HashMap;

/// A client file the server handed an identity to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientFile {
    pub salt: i64,
    pub identity: String,
    pub last_integrated_client_version: u64,
}

/// Integrated changesets in server version order plus the known client
/// files.
///
/// Versions are dense: the changeset at index `i` has server version
/// `i + 1`. History lives in memory only; after a restart every client
/// file is unknown and must reset.
#[derive(Debug, Default)]
pub(crate) struct ServerHistory {
    changesets: Vec<ServerChangeset>,
    clients: HashMap<u64, ClientFile>,
    next_ident: u64,
}

impl ServerHistory {
    pub fn new() -> Self {
        Self {
            next_ident: 1,
            ..Self::default()
        }
    }

    /// Newest server version.
    pub fn version(&self) -> u64 {
        self.changesets.len() as u64
    }

    /// Changesets newer than `version`.
    pub fn since(&self, version: u64) -> &[ServerChangeset] {
        let start = usize::try_from(version).unwrap_or(usize::MAX).min(self.changesets.len());
        &self.changesets[start..]
    }

    /// Appends a changeset and returns its server version.
    pub fn append(&mut self, origin: u64, timestamp: i64, operations: Vec<SyncOperation>) -> u64 {
        let server_version = self.version() + 1;
        self.changesets.push(ServerChangeset {
            server_version,
            origin_file_ident: origin,
            origin_timestamp: timestamp,
            operations,
        });
        server_version
    }

    /// Hands out a new client file identity.
    pub fn allocate(&mut self, identity: &str) -> FileIdent {
        let ident = FileIdent {
            ident: self.next_ident,
            salt: rand::random::<i64>() & i64::MAX,
        };
        self.next_ident += 1;
        self.clients.insert(
            ident.ident,
            ClientFile {
                salt: ident.salt,
                identity: identity.to_owned(),
                last_integrated_client_version: 0,
            },
        );
        ident
    }

    /// The client file with `ident`, when its salt matches.
    pub fn client(&self, ident: FileIdent) -> Option<&ClientFile> {
        self.clients.get(&ident.ident).filter(|c| c.salt == ident.salt)
    }

    /// Newest client version integrated from `ident`.
    pub fn last_integrated(&self, ident: u64) -> u64 {
        self.clients
            .get(&ident)
            .map_or(0, |c| c.last_integrated_client_version)
    }

    pub fn record_integrated(&mut self, ident: u64, client_version: u64) {
        if let Some(client) = self.clients.get_mut(&ident) {
            client.last_integrated_client_version =
                client.last_integrated_client_version.max(client_version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_sync_protocol::PrimaryKeyValue;

    #[test]
    fn versions_are_dense() {
        let mut history = ServerHistory::new();
        assert_eq!(history.version(), 0);
        assert_eq!(history.append(0, 0, Vec::new()), 1);
        assert_eq!(
            history.append(3, 0, vec![SyncOperation::erase("Task", PrimaryKeyValue::Int(1))]),
            2
        );
        assert_eq!(history.since(0).len(), 2);
        assert_eq!(history.since(1)[0].origin_file_ident, 3);
        assert!(history.since(7).is_empty());
    }

    #[test]
    fn client_files_check_the_salt() {
        let mut history = ServerHistory::new();
        let first = history.allocate("alice");
        let second = history.allocate("bob");
        assert_ne!(first.ident, second.ident);
        assert_eq!(history.client(first).unwrap().identity, "alice");
        let forged = FileIdent {
            ident: first.ident,
            salt: first.salt ^ 1,
        };
        assert!(history.client(forged).is_none());

        history.record_integrated(first.ident, 4);
        history.record_integrated(first.ident, 2);
        assert_eq!(history.last_integrated(first.ident), 4);
        assert_eq!(history.last_integrated(99), 0);
    }
}
