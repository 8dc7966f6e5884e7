//! Changeset instructions: the unit of replay for the commit log.

use crate::schema::{ObjectSchema, Property};
use crate::storage::slot::{CollectionPath, Slot};
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use crate::value::{PrimaryKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One deterministic mutation. Keys and element ids are allocated before the
/// instruction is recorded, so replaying a log reproduces identical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Instruction {
    SetSchemaVersion { version: u64 },
    AddClass { schema: ObjectSchema },
    RemoveClass { class: ClassKey },
    UpdateClass { schema: ObjectSchema },
    AddProperty { class: ClassKey, property: Property },
    RemoveProperty { class: ClassKey, property: PropertyKey },
    CreateObject { class: ClassKey, key: ObjKey, primary_key: Option<Value> },
    EraseObject { class: ClassKey, key: ObjKey },
    ClearTable { class: ClassKey },
    SetProperty { class: ClassKey, key: ObjKey, property: PropertyKey, slot: Slot },
    ListInsert { path: CollectionPath, index: usize, elem: u64, slot: Slot },
    ListSet { path: CollectionPath, index: usize, slot: Slot },
    ListErase { path: CollectionPath, index: usize },
    ListMove { path: CollectionPath, from: usize, to: usize },
    CollectionClear { path: CollectionPath },
    SetInsert { path: CollectionPath, elem: u64, value: Value },
    SetErase { path: CollectionPath, value: Value },
    DictInsert { path: CollectionPath, key: String, elem: u64, slot: Slot },
    DictErase { path: CollectionPath, key: String },
}

impl Instruction {
    /// Short tag used in log dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetSchemaVersion { .. } => "set_schema_version",
            Self::AddClass { .. } => "add_class",
            Self::RemoveClass { .. } => "remove_class",
            Self::UpdateClass { .. } => "update_class",
            Self::AddProperty { .. } => "add_property",
            Self::RemoveProperty { .. } => "remove_property",
            Self::CreateObject { .. } => "create_object",
            Self::EraseObject { .. } => "erase_object",
            Self::ClearTable { .. } => "clear_table",
            Self::SetProperty { .. } => "set",
            Self::ListInsert { .. } => "list_insert",
            Self::ListSet { .. } => "list_set",
            Self::ListErase { .. } => "list_erase",
            Self::ListMove { .. } => "list_move",
            Self::CollectionClear { .. } => "collection_clear",
            Self::SetInsert { .. } => "set_insert",
            Self::SetErase { .. } => "set_erase",
            Self::DictInsert { .. } => "dictionary_insert",
            Self::DictErase { .. } => "dictionary_erase",
        }
    }
}

/// An object erased by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErasedObject {
    /// Former address of the object.
    pub link: ObjLink,
    /// Class name at the time of erasure.
    pub class_name: String,
    /// Primary key, for classes that have one.
    pub primary_key: Option<PrimaryKey>,
}

/// Summary of what a commit touched, at top-level object granularity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitChanges {
    /// Objects created by the commit.
    pub created: BTreeSet<ObjLink>,
    /// Top-level objects whose own or embedded data changed (includes created).
    pub modified: BTreeSet<ObjLink>,
    /// Top-level objects erased by the commit.
    pub erased: Vec<ErasedObject>,
    /// Whether classes or properties were added, removed or altered.
    pub schema_changed: bool,
}

impl CommitChanges {
    /// Whether the commit changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.erased.is_empty() && !self.schema_changed
    }
}
