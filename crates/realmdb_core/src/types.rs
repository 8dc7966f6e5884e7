//! Key and version identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a committed version of a realm.
///
/// `version` increases by one on every commit. `index` counts commits since
/// the log was last compacted and is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId {
    /// Monotonic version number.
    pub version: u64,
    /// Position within the current log.
    pub index: u64,
}

impl VersionId {
    /// Creates a version identifier.
    #[must_use]
    pub const fn new(version: u64, index: u64) -> Self {
        Self { version, index }
    }

    /// Identifier of the version following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            version: self.version + 1,
            index: self.index + 1,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version:{}.{}", self.version, self.index)
    }
}

/// Stable identifier of a class (table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassKey(pub u32);

impl ClassKey {
    /// Raw key.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{}", self.0)
    }
}

/// Stable identifier of a stored property (column).
///
/// Keys are allocated per realm file and never reused, so a removed and
/// re-added property gets a fresh key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyKey(pub i64);

impl PropertyKey {
    /// Placeholder for properties not yet stored (and computed properties).
    pub const UNASSIGNED: Self = Self(-1);

    /// Raw key.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Whether this key was assigned by storage.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}", self.0)
    }
}

/// Stable identifier of an object within its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey(pub i64);

impl ObjKey {
    /// Raw key.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// A typed reference to an object: class plus key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjLink {
    /// Target class.
    pub class: ClassKey,
    /// Target object.
    pub key: ObjKey,
}

impl ObjLink {
    /// Creates a link.
    #[must_use]
    pub const fn new(class: ClassKey, key: ObjKey) -> Self {
        Self { class, key }
    }
}

impl fmt::Display for ObjLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let a = VersionId::new(3, 1);
        let b = VersionId::new(4, 0);
        assert!(a < b);
        assert_eq!(a.next(), VersionId::new(4, 2));
    }

    #[test]
    fn display_formats() {
        assert_eq!(VersionId::new(2, 1).to_string(), "version:2.1");
        assert_eq!(ClassKey(3).to_string(), "class:3");
        assert_eq!(PropertyKey(9).to_string(), "col:9");
        assert_eq!(ObjLink::new(ClassKey(1), ObjKey(5)).to_string(), "class:1/obj:5");
    }

    #[test]
    fn unassigned_property_key() {
        assert!(!PropertyKey::UNASSIGNED.is_assigned());
        assert!(PropertyKey(0).is_assigned());
    }
}
