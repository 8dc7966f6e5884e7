//! Log categories and levels.
//!
//! Every crate in the workspace logs through `tracing` with one of the
//! [`LogCategory`] names as the event target. The library never installs a
//! subscriber; hosts render a [`LogConfig`] into an `EnvFilter` directive
//! and install whichever subscriber they like.
//!
//! ```rust
//! use realmdb_core::logging::{LogCategory, LogConfig, LogLevel};
//!
//! let mut config = LogConfig::new(LogLevel::Warning);
//! config.set_level(LogCategory::Storage, LogLevel::Debug);
//! assert_eq!(config.level(LogCategory::Query), LogLevel::Debug);
//! assert!(config.directive().contains("realm.storage.query=debug"));
//! ```

use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Severity threshold, from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Everything.
    All,
    /// Tracing detail.
    Trace,
    /// Debugging detail.
    Debug,
    /// More than info, less than debug. Rendered as debug.
    Detail,
    /// Normal operation.
    Info,
    /// Recoverable problems.
    Warning,
    /// Failures.
    Error,
    /// Unrecoverable failures. Rendered as error.
    Fatal,
    /// Nothing.
    Off,
}

impl LogLevel {
    /// The `tracing` level name used in filter directives.
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            Self::All | Self::Trace => "trace",
            Self::Debug | Self::Detail => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Fatal => "error",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Detail => "detail",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Off => "off",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "detail" => Self::Detail,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warning,
            "error" => Self::Error,
            "fatal" => Self::Fatal,
            "off" => Self::Off,
            other => return Err(CoreError::illegal(format!("unknown log level '{other}'"))),
        })
    }
}

/// A node in the log category tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogCategory {
    /// `realm`
    Realm,
    /// `realm.storage`
    Storage,
    /// `realm.storage.transaction`
    Transaction,
    /// `realm.storage.query`
    Query,
    /// `realm.storage.object`
    Object,
    /// `realm.storage.notification`
    Notification,
    /// `realm.sdk`
    Sdk,
    /// `realm.sync`
    Sync,
    /// `realm.sync.client`
    Client,
    /// `realm.sync.client.session`
    Session,
    /// `realm.sync.client.reset`
    Reset,
    /// `realm.sync.server`
    Server,
}

impl LogCategory {
    /// Every category, parents before children.
    pub const ALL: [Self; 12] = [
        Self::Realm,
        Self::Storage,
        Self::Transaction,
        Self::Query,
        Self::Object,
        Self::Notification,
        Self::Sdk,
        Self::Sync,
        Self::Client,
        Self::Session,
        Self::Reset,
        Self::Server,
    ];

    /// The dotted name, also used as the `tracing` target.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Realm => "realm",
            Self::Storage => "realm.storage",
            Self::Transaction => "realm.storage.transaction",
            Self::Query => "realm.storage.query",
            Self::Object => "realm.storage.object",
            Self::Notification => "realm.storage.notification",
            Self::Sdk => "realm.sdk",
            Self::Sync => "realm.sync",
            Self::Client => "realm.sync.client",
            Self::Session => "realm.sync.client.session",
            Self::Reset => "realm.sync.client.reset",
            Self::Server => "realm.sync.server",
        }
    }

    /// The enclosing category; `None` for the root.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Realm => None,
            Self::Storage | Self::Sdk | Self::Sync => Some(Self::Realm),
            Self::Transaction | Self::Query | Self::Object | Self::Notification => {
                Some(Self::Storage)
            }
            Self::Client | Self::Server => Some(Self::Sync),
            Self::Session | Self::Reset => Some(Self::Client),
        }
    }

    /// All category names.
    #[must_use]
    pub fn all() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.name()).collect()
    }

    /// Looks a category up by its dotted name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-category thresholds.
///
/// Setting a level on a category applies to its descendants, except those
/// given a level of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    default: LogLevel,
    levels: BTreeMap<LogCategory, LogLevel>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogConfig {
    /// A config where every category logs at `level`.
    #[must_use]
    pub fn new(level: LogLevel) -> Self {
        Self {
            default: level,
            levels: BTreeMap::new(),
        }
    }

    /// Builder form of [`LogConfig::set_level`].
    #[must_use]
    pub fn with_level(mut self, category: LogCategory, level: LogLevel) -> Self {
        self.set_level(category, level);
        self
    }

    /// Sets the threshold for `category` and its descendants without their
    /// own level.
    pub fn set_level(&mut self, category: LogCategory, level: LogLevel) {
        self.levels.insert(category, level);
    }

    /// Sets a level by dotted category name.
    ///
    /// # Errors
    ///
    /// Fails for unknown category names.
    pub fn set_level_by_name(&mut self, category: &str, level: LogLevel) -> CoreResult<()> {
        let category = LogCategory::from_name(category)
            .ok_or_else(|| CoreError::illegal(format!("unknown log category '{category}'")))?;
        self.set_level(category, level);
        Ok(())
    }

    /// The effective threshold for `category`.
    #[must_use]
    pub fn level(&self, category: LogCategory) -> LogLevel {
        let mut current = Some(category);
        while let Some(c) = current {
            if let Some(level) = self.levels.get(&c) {
                return *level;
            }
            current = c.parent();
        }
        self.default
    }

    /// Renders an `EnvFilter` directive: the default level for foreign
    /// targets followed by the effective level of every category.
    #[must_use]
    pub fn directive(&self) -> String {
        let mut parts = vec![self.default.directive().to_string()];
        parts.extend(
            LogCategory::ALL
                .iter()
                .map(|c| format!("{}={}", c.name(), self.level(*c).directive())),
        );
        parts.join(",")
    }
}
