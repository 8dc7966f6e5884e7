//! Realm configuration.

use crate::error::CoreResult;
use crate::notify::Scheduler;
use crate::realm::migration::MigrationContext;
use crate::realm::Realm;
use crate::schema::Schema;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a declared schema is reconciled with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    /// Apply every change; non-additive changes need a version bump and run
    /// the migration function.
    #[default]
    Automatic,
    /// Never write; the stored schema must already match.
    Immutable,
    /// Never write; classes missing from the file read as empty.
    ReadOnly,
    /// Recreate the file when a migration would be required.
    SoftResetFile,
    /// Recreate the file on any version change or required migration.
    HardResetFile,
    /// Apply additive changes only, ignoring removals. Used for schemas
    /// discovered at runtime.
    AdditiveDiscovered,
    /// Apply additive changes only, ignoring removals.
    AdditiveExplicit,
    /// The migration function performs every change itself.
    Manual,
}

impl SchemaMode {
    /// Whether the mode never writes to the file.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Immutable | Self::ReadOnly)
    }

    /// Whether only additive changes are applied.
    #[must_use]
    pub const fn is_additive(self) -> bool {
        matches!(self, Self::AdditiveDiscovered | Self::AdditiveExplicit)
    }
}

/// Marks a realm as the local copy of synchronized data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMarker {
    /// Flexible (query based) sync rather than partition based.
    pub flexible: bool,
}

/// Runs inside the schema-update write transaction.
pub type MigrationFunction = Arc<dyn Fn(&mut MigrationContext) -> CoreResult<()> + Send + Sync>;

/// Populates a newly created file.
pub type InitializationFunction = Arc<dyn Fn(&Realm) -> CoreResult<()> + Send + Sync>;

/// Decides whether to compact at first open from (total bytes, used bytes).
pub type ShouldCompactFunction = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// Everything needed to open a realm.
#[derive(Clone)]
pub struct RealmConfig {
    /// File path. Also identifies in-memory realms.
    pub path: PathBuf,
    /// Keep data in memory only; shared between handles with the same path.
    pub in_memory: bool,
    /// Declared schema. `None` uses whatever is stored.
    pub schema: Option<Schema>,
    /// Declared schema version.
    pub schema_version: u64,
    /// Reconciliation mode.
    pub schema_mode: SchemaMode,
    /// Migration callback.
    pub migration_function: Option<MigrationFunction>,
    /// Initial data callback.
    pub initialization_function: Option<InitializationFunction>,
    /// Compaction-on-open policy.
    pub should_compact_on_launch: Option<ShouldCompactFunction>,
    /// Ceiling on concurrently pinned versions.
    pub max_number_of_active_versions: u64,
    /// Execution context. `None` binds a new [`crate::ManualScheduler`] to
    /// the opening thread.
    pub scheduler: Option<Arc<dyn Scheduler>>,
    /// Reuse an open handle for the same file and scheduler.
    pub cache: bool,
    /// Deliver notifications when other handles commit.
    pub automatic_change_notifications: bool,
    /// Delete objects nothing links to when their class becomes embedded.
    pub automatic_backlink_handling: bool,
    /// Refuse to upgrade older file formats.
    pub disable_format_upgrade: bool,
    /// Fsync the log on every commit.
    pub sync_on_commit: bool,
    /// Set for synchronized realms.
    pub sync: Option<SyncMarker>,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("default.realm"),
            in_memory: false,
            schema: None,
            schema_version: 0,
            schema_mode: SchemaMode::Automatic,
            migration_function: None,
            initialization_function: None,
            should_compact_on_launch: None,
            max_number_of_active_versions: u64::MAX,
            scheduler: None,
            cache: false,
            automatic_change_notifications: true,
            automatic_backlink_handling: false,
            disable_format_upgrade: false,
            sync_on_commit: true,
            sync: None,
        }
    }
}

impl fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmConfig")
            .field("path", &self.path)
            .field("in_memory", &self.in_memory)
            .field("schema_version", &self.schema_version)
            .field("schema_mode", &self.schema_mode)
            .field("classes", &self.schema.as_ref().map(Schema::len))
            .field("cache", &self.cache)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl RealmConfig {
    /// Configuration for a file at `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory realm identified by `name`.
    #[must_use]
    pub fn in_memory(name: impl AsRef<Path>) -> Self {
        Self {
            path: name.as_ref().to_path_buf(),
            in_memory: true,
            ..Self::default()
        }
    }

    /// Sets the declared schema and its version.
    #[must_use]
    pub fn schema(mut self, schema: Schema, version: u64) -> Self {
        self.schema = Some(schema);
        self.schema_version = version;
        self
    }

    /// Sets the schema mode.
    #[must_use]
    pub const fn schema_mode(mut self, mode: SchemaMode) -> Self {
        self.schema_mode = mode;
        self
    }

    /// Sets the migration callback.
    #[must_use]
    pub fn migration(
        mut self,
        f: impl Fn(&mut MigrationContext) -> CoreResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.migration_function = Some(Arc::new(f));
        self
    }

    /// Sets the initial data callback.
    #[must_use]
    pub fn initialization(mut self, f: impl Fn(&Realm) -> CoreResult<()> + Send + Sync + 'static) -> Self {
        self.initialization_function = Some(Arc::new(f));
        self
    }

    /// Sets the compaction-on-open policy.
    #[must_use]
    pub fn should_compact_on_launch(
        mut self,
        f: impl Fn(u64, u64) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_compact_on_launch = Some(Arc::new(f));
        self
    }

    /// Sets the pinned version ceiling.
    #[must_use]
    pub const fn max_number_of_active_versions(mut self, limit: u64) -> Self {
        self.max_number_of_active_versions = limit;
        self
    }

    /// Sets the scheduler.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enables handle reuse.
    #[must_use]
    pub const fn cache(mut self, value: bool) -> Self {
        self.cache = value;
        self
    }

    /// Enables or disables notifications for commits made elsewhere.
    #[must_use]
    pub const fn automatic_change_notifications(mut self, value: bool) -> Self {
        self.automatic_change_notifications = value;
        self
    }

    /// Enables automatic backlink handling for embedded conversions.
    #[must_use]
    pub const fn automatic_backlink_handling(mut self, value: bool) -> Self {
        self.automatic_backlink_handling = value;
        self
    }

    /// Sets whether commits are fsynced.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Marks the realm as synchronized.
    #[must_use]
    pub const fn synced(mut self, flexible: bool) -> Self {
        self.sync = Some(SyncMarker { flexible });
        self
    }

    /// Whether the realm never writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.schema_mode.is_read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RealmConfig::new("a.realm");
        assert_eq!(config.schema_mode, SchemaMode::Automatic);
        assert!(config.automatic_change_notifications);
        assert!(!config.cache);
        assert!(!config.is_read_only());
    }

    #[test]
    fn builder_pattern() {
        let config = RealmConfig::in_memory("mem")
            .schema(Schema::default(), 3)
            .schema_mode(SchemaMode::ReadOnly)
            .max_number_of_active_versions(8)
            .synced(true);
        assert!(config.in_memory);
        assert_eq!(config.schema_version, 3);
        assert!(config.is_read_only());
        assert_eq!(config.max_number_of_active_versions, 8);
        assert_eq!(config.sync, Some(SyncMarker { flexible: true }));
    }
}
