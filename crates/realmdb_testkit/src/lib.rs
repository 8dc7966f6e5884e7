//! # realmdb testkit
//!
//! Test utilities for realmdb.
//!
//! This crate provides:
//! - Temporary realms and canonical schemas ([`TestRealm`], [`person_schema`])
//! - Property-based test generators using proptest
//! - Helpers that damage realm files the way a crash would
//!
//! ## Usage
//!
//! ```rust
//! use realmdb_testkit::prelude::*;
//!
//! with_temp_realm(person_schema(), |realm| {
//!     realm.write(|r| add_person(r, 1, "Ada", 36).map(|_| ())).unwrap();
//!     assert_eq!(realm.find_all("Person").unwrap().count().unwrap(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
