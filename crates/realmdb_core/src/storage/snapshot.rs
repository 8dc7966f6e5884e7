//! Immutable versions of the whole realm.

use crate::error::{CoreError, CoreResult};
use crate::schema::{ObjectSchema, Schema};
use crate::storage::slot::{CollectionPath, ObjectData, PathElement, Slot};
use crate::storage::table::TableData;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The state of a realm at one version.
///
/// Tables and objects sit behind `Arc`s, so deriving a new version from an
/// old one only copies what the write touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotData {
    pub version: VersionId,
    pub schema_version: Option<u64>,
    pub tables: BTreeMap<ClassKey, Arc<TableData>>,
    pub next_class_key: u32,
    pub next_property_key: i64,
    pub next_id: u64,
    #[serde(skip)]
    pub schema: Arc<Schema>,
    #[serde(skip)]
    pub class_names: HashMap<String, ClassKey>,
}

impl SnapshotData {
    /// A new, empty realm.
    pub fn empty() -> Self {
        Self {
            version: VersionId::new(1, 0),
            schema_version: None,
            tables: BTreeMap::new(),
            next_class_key: 0,
            next_property_key: 0,
            next_id: 1,
            schema: Arc::new(Schema::default()),
            class_names: HashMap::new(),
        }
    }

    /// Rebuilds derived lookup structures after decoding.
    pub fn rebuild_derived(&mut self) {
        for table in self.tables.values_mut() {
            Arc::make_mut(table).rebuild_pk_index();
        }
        self.rebuild_schema();
    }

    pub fn rebuild_schema(&mut self) {
        let classes: Vec<ObjectSchema> = self.tables.values().map(|t| t.schema.clone()).collect();
        self.class_names = self
            .tables
            .iter()
            .map(|(key, t)| (t.schema.name.clone(), *key))
            .collect();
        self.schema = Arc::new(Schema::new(classes));
    }

    pub fn class_key(&self, name: &str) -> Option<ClassKey> {
        self.class_names.get(name).copied()
    }

    pub fn table(&self, class: ClassKey) -> CoreResult<&TableData> {
        self.tables
            .get(&class)
            .map(|t| t.as_ref())
            .ok_or_else(|| CoreError::NoSuchClass {
                name: class.to_string(),
            })
    }

    pub fn table_mut(&mut self, class: ClassKey) -> CoreResult<&mut TableData> {
        self.tables
            .get_mut(&class)
            .map(Arc::make_mut)
            .ok_or_else(|| CoreError::NoSuchClass {
                name: class.to_string(),
            })
    }

    pub fn class_name(&self, class: ClassKey) -> String {
        self.tables
            .get(&class)
            .map_or_else(|| class.to_string(), |t| t.schema.name.clone())
    }

    pub fn object(&self, class: ClassKey, key: ObjKey) -> Option<&ObjectData> {
        self.tables.get(&class).and_then(|t| t.get(key))
    }

    pub fn object_exists(&self, link: ObjLink) -> bool {
        self.object(link.class, link.key).is_some()
    }

    pub fn require_object(&self, class: ClassKey, key: ObjKey) -> CoreResult<&ObjectData> {
        self.object(class, key).ok_or_else(|| CoreError::NoSuchObject {
            class: self.class_name(class),
            key: key.to_string(),
        })
    }

    pub fn object_mut(&mut self, class: ClassKey, key: ObjKey) -> CoreResult<&mut ObjectData> {
        let name = self.class_name(class);
        self.table_mut(class)?
            .get_mut(key)
            .ok_or_else(|| CoreError::NoSuchObject {
                class: name,
                key: key.to_string(),
            })
    }

    /// Resolves a collection path to its slot.
    pub fn resolve(&self, path: &CollectionPath) -> CoreResult<&Slot> {
        let obj = self.require_object(path.class, path.key)?;
        let mut slot = obj.get(path.property).ok_or_else(|| {
            CoreError::invalidated(format!("property {} no longer exists", path.property))
        })?;
        for element in &path.path {
            slot = step(slot, element)?;
        }
        Ok(slot)
    }

    /// Mutable variant of [`Self::resolve`].
    pub fn resolve_mut(&mut self, path: &CollectionPath) -> CoreResult<&mut Slot> {
        let obj = self.object_mut(path.class, path.key)?;
        let mut slot = obj.values.get_mut(&path.property).ok_or_else(|| {
            CoreError::invalidated(format!("property {} no longer exists", path.property))
        })?;
        for element in &path.path {
            slot = step_mut(slot, element)?;
        }
        Ok(slot)
    }

    /// Every stored link pointing at `target`, as (origin class, origin
    /// object, origin property, count).
    pub fn backlinks(&self, target: ObjLink) -> Vec<(ClassKey, ObjKey, PropertyKey, usize)> {
        let mut out = Vec::new();
        for (class, table) in &self.tables {
            let props: Vec<PropertyKey> = table
                .schema
                .persisted_properties
                .iter()
                .filter(|p| may_hold_link_to(p, &self.class_name(target.class)))
                .map(|p| p.key)
                .collect();
            if props.is_empty() {
                continue;
            }
            for (key, obj) in &table.objects {
                for prop in &props {
                    if let Some(slot) = obj.get(*prop) {
                        let count = slot.count_links_to(target);
                        if count > 0 {
                            out.push((*class, *key, *prop, count));
                        }
                    }
                }
            }
        }
        out
    }
}

pub(crate) fn may_hold_link_to(property: &crate::schema::Property, target_class: &str) -> bool {
    use crate::schema::PropertyType;
    match property.property_type {
        PropertyType::Object => property.link_target.as_deref() == Some(target_class),
        PropertyType::Mixed => true,
        _ => false,
    }
}

fn step<'a>(slot: &'a Slot, element: &PathElement) -> CoreResult<&'a Slot> {
    match (slot, element) {
        (Slot::List(list), PathElement::Elem(id)) => list
            .items
            .iter()
            .find(|e| e.id == *id)
            .map(|e| &e.slot)
            .ok_or_else(|| CoreError::invalidated("list element was removed")),
        (Slot::Dictionary(dict), PathElement::Key(key)) => dict
            .entries
            .get(key)
            .map(|e| &e.slot)
            .ok_or_else(|| CoreError::invalidated(format!("dictionary key '{key}' was removed"))),
        _ => Err(CoreError::invalidated("nested collection was replaced")),
    }
}

fn step_mut<'a>(slot: &'a mut Slot, element: &PathElement) -> CoreResult<&'a mut Slot> {
    match (slot, element) {
        (Slot::List(list), PathElement::Elem(id)) => list
            .items
            .iter_mut()
            .find(|e| e.id == *id)
            .map(|e| &mut e.slot)
            .ok_or_else(|| CoreError::invalidated("list element was removed")),
        (Slot::Dictionary(dict), PathElement::Key(key)) => dict
            .entries
            .get_mut(key)
            .map(|e| &mut e.slot)
            .ok_or_else(|| CoreError::invalidated(format!("dictionary key '{key}' was removed"))),
        _ => Err(CoreError::invalidated("nested collection was replaced")),
    }
}
