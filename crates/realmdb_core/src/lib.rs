//! # realmdb core
//!
//! Embedded object database with multi-version concurrency.
//!
//! This crate provides:
//! - A versioned commit log with snapshot isolation for readers
//! - Schemas, migrations and typed objects with links and backlinks
//! - Lists, sets and dictionaries, nestable inside mixed values
//! - A string query language with live [`Results`]
//! - Change notifications delivered through a [`Scheduler`]
//! - [`ThreadSafeReference`] for handing accessors across threads
//!
//! ```rust
//! use realmdb_core::{ObjectSchema, Property, PropertyType, Realm, RealmConfig, Schema};
//!
//! let schema = Schema::new(vec![ObjectSchema::new("Person")
//!     .property(Property::new("_id", PropertyType::Int).primary_key())
//!     .property(Property::new("age", PropertyType::Int))]);
//! let realm = Realm::open(RealmConfig::in_memory("doc-lib").schema(schema, 1)).unwrap();
//! realm
//!     .write(|r| {
//!         r.create_object_with_primary_key("Person", 1)?.set_value("age", 30)?;
//!         r.create_object_with_primary_key("Person", 2)?.set_value("age", 12)?;
//!         Ok(())
//!     })
//!     .unwrap();
//! let adults = realm.find_all("Person").unwrap().filter("age > 18", &[]).unwrap();
//! assert_eq!(adults.count().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collections;
mod error;
pub mod logging;
mod notify;
mod object;
mod query;
mod realm;
mod schema;
mod storage;
mod thread_safe;
mod types;
mod value;

pub use collections::{Dictionary, List, Set};
pub use error::{CoreError, CoreResult, ErrorCategories, UserCodeError};
pub use notify::{
    CollectionChangeSet, DictionaryChangeSet, FrozenScheduler, IndexSet, KeyPathArray,
    ManualScheduler, Move, NotificationToken, ObjectChangeSet, Scheduler, WorkQueue,
};
pub use object::Object;
pub use query::{Query, Results};
pub use realm::{
    AsyncHandle, CommitSubscription, InitializationFunction, MigrationContext, MigrationFunction,
    Realm, RealmCache, RealmConfig, SchemaMode, ShouldCompactFunction, SyncMarker,
};
pub use schema::{
    CollectionType, ObjectSchema, ObjectType, Property, PropertyType, Schema, SchemaChange,
    ValidationMode,
};
pub use storage::{CommitChanges, CommitEvent, CommitOrigin, ErasedObject, LogEntry, LogReport};
pub use thread_safe::ThreadSafeReference;
pub use types::{ClassKey, ObjKey, ObjLink, PropertyKey, VersionId};
pub use value::{ObjectId, PrimaryKey, Timestamp, Value};

pub use uuid::Uuid;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
