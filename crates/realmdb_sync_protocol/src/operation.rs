//! Object-level replication records.

use crate::error::ProtocolResult;
use crate::value::{Fields, Payload, PrimaryKeyValue};
use realmdb_codec::to_cbor;
use serde::{Deserialize, Serialize};

/// One change to one top-level object.
///
/// An upsert carries the object's complete state, so applying the newest
/// upsert for an object is enough to converge. Properties missing from
/// `fields` are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncOperation {
    /// Create the object if needed and assign `fields`.
    Upsert {
        /// Class name.
        class: String,
        /// Primary key.
        key: PrimaryKeyValue,
        /// Property values.
        fields: Fields,
    },
    /// Delete the object if it exists.
    Erase {
        /// Class name.
        class: String,
        /// Primary key.
        key: PrimaryKeyValue,
    },
}

impl SyncOperation {
    /// An upsert with no fields yet.
    pub fn upsert(class: impl Into<String>, key: PrimaryKeyValue) -> Self {
        Self::Upsert {
            class: class.into(),
            key,
            fields: Fields::new(),
        }
    }

    /// An erase.
    pub fn erase(class: impl Into<String>, key: PrimaryKeyValue) -> Self {
        Self::Erase {
            class: class.into(),
            key,
        }
    }

    /// Adds a field to an upsert; erases are returned unchanged.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Payload) -> Self {
        if let Self::Upsert { fields, .. } = &mut self {
            fields.insert(name.into(), value);
        }
        self
    }

    /// Class of the object.
    pub fn class(&self) -> &str {
        match self {
            Self::Upsert { class, .. } | Self::Erase { class, .. } => class,
        }
    }

    /// Primary key of the object.
    pub fn key(&self) -> &PrimaryKeyValue {
        match self {
            Self::Upsert { key, .. } | Self::Erase { key, .. } => key,
        }
    }

    /// Whether this deletes the object.
    pub fn is_erase(&self) -> bool {
        matches!(self, Self::Erase { .. })
    }
}

/// The operations of one local commit, as uploaded by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Client-side version that produced the changeset.
    pub client_version: u64,
    /// Newest server version integrated locally when the commit was made.
    pub last_integrated_server_version: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub origin_timestamp: i64,
    /// Operations in commit order.
    pub operations: Vec<SyncOperation>,
}

impl Changeset {
    /// Encoded size, used for progress accounting.
    ///
    /// # Errors
    ///
    /// Fails when the changeset cannot be encoded.
    pub fn encoded_size(&self) -> ProtocolResult<u64> {
        Ok(to_cbor(self)?.len() as u64)
    }
}

/// A changeset as integrated by the server and sent to other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerChangeset {
    /// Server version produced by integrating the changeset.
    pub server_version: u64,
    /// Client file that uploaded it; 0 for server-originated data.
    pub origin_file_ident: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub origin_timestamp: i64,
    /// Operations in commit order.
    pub operations: Vec<SyncOperation>,
}

impl ServerChangeset {
    /// Encoded size, used for progress accounting.
    ///
    /// # Errors
    ///
    /// Fails when the changeset cannot be encoded.
    pub fn encoded_size(&self) -> ProtocolResult<u64> {
        Ok(to_cbor(self)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let op = SyncOperation::upsert("Task", PrimaryKeyValue::Int(3))
            .with_field("done", Payload::Bool(true));
        assert_eq!(op.class(), "Task");
        assert_eq!(op.key(), &PrimaryKeyValue::Int(3));
        assert!(!op.is_erase());
        let SyncOperation::Upsert { fields, .. } = &op else {
            panic!("expected upsert");
        };
        assert_eq!(fields.get("done"), Some(&Payload::Bool(true)));

        let erase = SyncOperation::erase("Task", PrimaryKeyValue::Int(3))
            .with_field("ignored", Payload::Null);
        assert!(erase.is_erase());
        assert_eq!(erase, SyncOperation::erase("Task", PrimaryKeyValue::Int(3)));
    }

    #[test]
    fn size_grows_with_operations() {
        let mut changeset = Changeset {
            client_version: 1,
            last_integrated_server_version: 0,
            origin_timestamp: 0,
            operations: Vec::new(),
        };
        let empty = changeset.encoded_size().unwrap();
        changeset
            .operations
            .push(SyncOperation::erase("Task", PrimaryKeyValue::String("a".into())));
        assert!(changeset.encoded_size().unwrap() > empty);
    }
}
