//! Error types for the realm core.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// An error raised by host code inside a callback (migration, data
/// initialization, notification), carried back to the caller untouched.
#[derive(Clone)]
pub struct UserCodeError(pub Arc<dyn StdError + Send + Sync>);

impl UserCodeError {
    /// Wraps any host error.
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self(Arc::new(error))
    }

    /// Wraps a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    /// Attempts to view the original error as `E`.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for UserCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for UserCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// Coarse error classes, usable as a mask when filtering errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCategories(u32);

impl ErrorCategories {
    /// Programming error in the caller.
    pub const LOGIC: Self = Self(0x0001);
    /// Condition that depends on runtime state.
    pub const RUNTIME: Self = Self(0x0002);
    /// Bad argument.
    pub const INVALID_ARG: Self = Self(0x0004);
    /// File system problem.
    pub const FILE_ACCESS: Self = Self(0x0008);
    /// Operating system error.
    pub const SYSTEM_ERROR: Self = Self(0x0010);
    /// Raised by the sync client.
    pub const SYNC_ERROR: Self = Self(0x0080);
    /// Raised from host callback code.
    pub const CALLBACK: Self = Self(0x0100);

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw mask.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ErrorCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Errors raised by the realm core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] realmdb_storage::StorageError),

    /// Record codec error.
    #[error("codec error: {0}")]
    Codec(#[from] realmdb_codec::CodecError),

    /// I/O error outside the storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Query text could not be parsed or bound.
    #[error("invalid query at position {position}: {message}")]
    Parse {
        /// What went wrong.
        message: String,
        /// Byte offset into the query string.
        position: usize,
    },

    /// Declared schema does not match the stored one under the active mode.
    #[error("schema mismatch: {}", .changes.join("; "))]
    SchemaMismatch {
        /// Human readable description of each incompatible change.
        changes: Vec<String>,
    },

    /// A schema failed validation.
    #[error("schema validation failed: {}", .errors.join("; "))]
    SchemaValidation {
        /// Each rule violation.
        errors: Vec<String>,
    },

    /// Requested schema version is lower than the stored one.
    #[error("provided schema version {requested} is less than last set version {current}")]
    InvalidSchemaVersion {
        /// Version stored in the file.
        current: u64,
        /// Version requested by the caller.
        requested: u64,
    },

    /// An object with the same primary key already exists.
    #[error("attempting to create an object of type '{class}' with an existing primary key value {value}")]
    DuplicatePrimaryKey {
        /// Class name.
        class: String,
        /// Rendered primary key.
        value: String,
    },

    /// The object or collection cannot be copied into the target.
    #[error("not clonable: {message}")]
    NotClonable {
        /// Why the copy was refused.
        message: String,
    },

    /// Too many versions are pinned at once.
    #[error("number of active versions ({active}) exceeds the limit of {limit}")]
    VersionLimitExceeded {
        /// Versions currently pinned.
        active: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// The realm file could not be accessed.
    #[error("unable to access '{}': {message}", .path.display())]
    FileAccess {
        /// Path involved.
        path: PathBuf,
        /// Underlying cause.
        message: String,
    },

    /// The process lacks permission on the realm file.
    #[error("permission denied for '{}'", .path.display())]
    FilePermissionDenied {
        /// Path involved.
        path: PathBuf,
    },

    /// The lock file was written by an incompatible version.
    #[error("incompatible lock file at '{}': {message}", .path.display())]
    IncompatibleLockFile {
        /// Lock file path.
        path: PathBuf,
        /// Mismatch details.
        message: String,
    },

    /// Files of a realm still open in this process were asked to be deleted.
    #[error("cannot delete files of an open realm: '{}'", .path.display())]
    DeleteOpenedRealm {
        /// Realm path.
        path: PathBuf,
    },

    /// Index outside of a collection.
    #[error("index {index} is out of bounds (size {size})")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Collection size.
        size: usize,
    },

    /// Accessor points at deleted or replaced data.
    #[error("accessor is no longer valid: {message}")]
    Invalidated {
        /// What was invalidated.
        message: String,
    },

    /// A live accessor was used from a thread other than its realm's.
    #[error("realm accessed from incorrect thread")]
    WrongThread,

    /// A mutation was attempted outside a write transaction.
    #[error("cannot modify managed objects outside of a write transaction")]
    NotInWriteTransaction,

    /// The transaction state does not permit this call.
    #[error("wrong transaction state: {message}")]
    WrongTransactionState {
        /// Details.
        message: String,
    },

    /// The realm is read-only or frozen.
    #[error("realm is read-only: {message}")]
    ReadOnly {
        /// Details.
        message: String,
    },

    /// The realm was closed.
    #[error("realm has been closed")]
    Closed,

    /// Unknown class.
    #[error("no such table: '{name}'")]
    NoSuchClass {
        /// Class name.
        name: String,
    },

    /// Unknown property.
    #[error("no such property '{property}' on class '{class}'")]
    NoSuchProperty {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },

    /// Unknown object.
    #[error("no object with key {key} in class '{class}'")]
    NoSuchObject {
        /// Class name.
        class: String,
        /// Rendered key.
        key: String,
    },

    /// A value of the wrong type was written or compared.
    #[error("property '{property}' expects {expected}, got {actual}")]
    PropertyTypeMismatch {
        /// Property name.
        property: String,
        /// Expected type.
        expected: String,
        /// Supplied type.
        actual: String,
    },

    /// Null written to a required property.
    #[error("property '{property}' is not nullable")]
    NotNullable {
        /// Property name.
        property: String,
    },

    /// The call is not allowed on this kind of object or state.
    #[error("illegal operation: {message}")]
    IllegalOperation {
        /// Details.
        message: String,
    },

    /// A schema migration could not be completed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Details.
        message: String,
    },

    /// The stored file is not a readable realm.
    #[error("invalid realm file: {message}")]
    InvalidDatabase {
        /// Details.
        message: String,
    },

    /// Host callback reported an error.
    #[error("callback failed: {0}")]
    Callback(UserCodeError),
}

impl CoreError {
    /// Creates a parse error at `position`.
    pub fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    /// Creates an invalidated-accessor error.
    pub fn invalidated(message: impl Into<String>) -> Self {
        Self::Invalidated {
            message: message.into(),
        }
    }

    /// Creates an illegal operation error.
    pub fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalOperation {
            message: message.into(),
        }
    }

    /// Creates a wrong transaction state error.
    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::WrongTransactionState {
            message: message.into(),
        }
    }

    /// Creates a read-only error.
    pub fn read_only(message: impl Into<String>) -> Self {
        Self::ReadOnly {
            message: message.into(),
        }
    }

    /// Creates a migration failure.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid file error.
    pub fn invalid_database(message: impl Into<String>) -> Self {
        Self::InvalidDatabase {
            message: message.into(),
        }
    }

    /// Creates a file access error.
    pub fn file_access(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileAccess {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Maps an I/O error on `path` to the matching file error.
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::FilePermissionDenied { path },
            _ => Self::FileAccess {
                path,
                message: err.to_string(),
            },
        }
    }

    /// The classes this error belongs to.
    #[must_use]
    pub fn categories(&self) -> ErrorCategories {
        use ErrorCategories as C;
        match self {
            Self::Storage(_) | Self::Io(_) => C::RUNTIME | C::SYSTEM_ERROR | C::FILE_ACCESS,
            Self::FileAccess { .. }
            | Self::FilePermissionDenied { .. }
            | Self::IncompatibleLockFile { .. }
            | Self::DeleteOpenedRealm { .. }
            | Self::InvalidDatabase { .. } => C::RUNTIME | C::FILE_ACCESS,
            Self::Codec(_) | Self::VersionLimitExceeded { .. } | Self::Invalidated { .. } => {
                C::RUNTIME
            }
            Self::Parse { .. }
            | Self::IndexOutOfBounds { .. }
            | Self::PropertyTypeMismatch { .. }
            | Self::NotNullable { .. }
            | Self::NoSuchClass { .. }
            | Self::NoSuchProperty { .. }
            | Self::NoSuchObject { .. }
            | Self::InvalidSchemaVersion { .. } => C::LOGIC | C::INVALID_ARG,
            Self::SchemaMismatch { .. }
            | Self::SchemaValidation { .. }
            | Self::MigrationFailed { .. }
            | Self::DuplicatePrimaryKey { .. }
            | Self::NotClonable { .. } => C::LOGIC | C::RUNTIME,
            Self::WrongThread
            | Self::NotInWriteTransaction
            | Self::WrongTransactionState { .. }
            | Self::ReadOnly { .. }
            | Self::Closed
            | Self::IllegalOperation { .. } => C::LOGIC,
            Self::Callback(_) => C::CALLBACK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_reports_position() {
        let err = CoreError::parse("unexpected token", 7);
        assert_eq!(err.to_string(), "invalid query at position 7: unexpected token");
        assert!(err.categories().contains(ErrorCategories::INVALID_ARG));
    }

    #[test]
    fn callback_error_round_trips_host_error() {
        let host = io::Error::new(io::ErrorKind::Other, "host exploded");
        let err = CoreError::Callback(UserCodeError::new(host));
        let CoreError::Callback(inner) = &err else {
            panic!("expected callback error");
        };
        let original = inner.downcast_ref::<io::Error>().unwrap();
        assert_eq!(original.to_string(), "host exploded");
        assert_eq!(err.categories(), ErrorCategories::CALLBACK);
    }

    #[test]
    fn permission_denied_maps_to_dedicated_variant() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let err = CoreError::from_io("/tmp/x.realm", &io_err);
        assert!(matches!(err, CoreError::FilePermissionDenied { .. }));
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            CoreError::from_io("/tmp/x.realm", &io_err),
            CoreError::FileAccess { .. }
        ));
    }
}
