//! List, set and dictionary accessors.
//!
//! A collection handle names its collection by path (owning object,
//! property, and the chain of elements leading into nested collections)
//! plus the collection's id. The id is checked on every access, so a
//! handle to a nested collection that was overwritten reports
//! [`CoreError::Invalidated`] instead of reaching the replacement.

mod dictionary;
mod list;
mod set;

pub use dictionary::Dictionary;
pub use list::List;
pub use set::Set;

use crate::error::{CoreError, CoreResult};
use crate::notify::diff::Row;
use crate::object::{check_same_file, create_embedded, embedded_target, Object};
use crate::query::Results;
use crate::realm::Realm;
use crate::schema::{Property, PropertyType};
use crate::storage::slot::{CollectionPath, Element, PathElement, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::storage::store::WriteTxn;
use crate::types::ObjLink;
use crate::value::Value;

/// Realm-independent address of a collection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CollectionRef {
    pub path: CollectionPath,
    pub id: u64,
    /// Describes one element: type, nullability and link target.
    pub element: Property,
}

impl CollectionRef {
    /// The slot holding the collection, checked against the handle's id.
    pub fn resolve<'a>(&self, snap: &'a SnapshotData) -> CoreResult<&'a Slot> {
        let slot = snap
            .resolve(&self.path)
            .map_err(|err| CoreError::invalidated(format!("collection is gone: {err}")))?;
        if slot.collection_id() != Some(self.id) {
            return Err(CoreError::invalidated("collection was replaced"));
        }
        Ok(slot)
    }

    /// Address of a collection nested in one of this collection's elements.
    pub fn nested(&self, step: PathElement, slot: &Slot) -> CoreResult<Self> {
        let id = slot
            .collection_id()
            .ok_or_else(|| CoreError::illegal("element does not hold a collection"))?;
        let mut path = self.path.clone();
        path.path.push(step);
        Ok(Self {
            path,
            id,
            element: mixed_element(&self.element.name),
        })
    }

    /// Whether elements are links to objects of one class.
    pub fn holds_objects(&self) -> bool {
        self.element.property_type == PropertyType::Object
    }
}

/// Element description for collections nested in mixed values.
pub(crate) fn mixed_element(name: &str) -> Property {
    Property::new(name.to_owned(), PropertyType::Mixed).nullable()
}

/// Rows of a collection in its iteration order.
pub(crate) fn collection_rows(slot: &Slot) -> Vec<Row> {
    let row = |e: &Element| Row {
        id: e.id,
        value: e.slot.to_value(),
    };
    match slot {
        Slot::List(l) => l.items.iter().map(row).collect(),
        Slot::Set(s) => s.items.iter().map(row).collect(),
        Slot::Dictionary(d) => d.entries.values().map(row).collect(),
        Slot::Value(_) => Vec::new(),
    }
}

/// Shared state and plumbing of the three accessors.
#[derive(Debug, Clone)]
pub(crate) struct Handle {
    realm: Realm,
    target: CollectionRef,
}

impl Handle {
    fn new(realm: Realm, target: CollectionRef) -> Self {
        Self { realm, target }
    }

    fn read<T>(&self, f: impl FnOnce(&SnapshotData, &Slot) -> CoreResult<T>) -> CoreResult<T> {
        self.realm.read(|snap| {
            let slot = self.target.resolve(snap)?;
            f(snap, slot)
        })
    }

    fn write<T>(&self, f: impl FnOnce(&mut WriteTxn, &Slot) -> CoreResult<T>) -> CoreResult<T> {
        self.realm.with_txn(|txn| {
            let slot = self.target.resolve(txn.snapshot())?.clone();
            f(txn, &slot)
        })
    }

    fn size(&self) -> CoreResult<usize> {
        self.read(|_, slot| {
            Ok(match slot {
                Slot::List(l) => l.items.len(),
                Slot::Set(s) => s.items.len(),
                Slot::Dictionary(d) => d.entries.len(),
                Slot::Value(_) => 0,
            })
        })
    }

    fn is_valid(&self) -> bool {
        self.read(|_, _| Ok(())).is_ok()
    }

    fn property(&self) -> CoreResult<Property> {
        self.realm.read(|snap| {
            let schema = &snap.table(self.target.path.class)?.schema;
            schema
                .property_for_key(self.target.path.property)
                .cloned()
                .ok_or_else(|| CoreError::invalidated("property no longer exists"))
        })
    }

    fn object(&self, value: &Value) -> CoreResult<Option<Object>> {
        match value {
            Value::Link(link) => Ok(Some(Object::new(self.realm.clone(), *link))),
            Value::Null => Ok(None),
            other => Err(CoreError::PropertyTypeMismatch {
                property: self.target.element.name.clone(),
                expected: "link".to_owned(),
                actual: other.type_name().to_owned(),
            }),
        }
    }

    fn new_embedded(&self, txn: &mut WriteTxn) -> CoreResult<ObjLink> {
        let target = embedded_target(txn.snapshot(), &self.target.element)?;
        create_embedded(txn, target)
    }

    fn require_mixed(&self) -> CoreResult<()> {
        if self.target.element.property_type == PropertyType::Mixed {
            Ok(())
        } else {
            Err(CoreError::illegal(format!(
                "only mixed collections can hold nested collections, '{}' holds {}",
                self.target.element.name, self.target.element.property_type
            )))
        }
    }

    /// Linked objects currently held, for `remove_all`.
    fn linked(&self, slot: &Slot) -> CoreResult<Vec<ObjLink>> {
        if !self.target.holds_objects() {
            return Err(CoreError::illegal("remove_all needs a collection of objects"));
        }
        let mut links = Vec::new();
        slot.collect_links(&mut links);
        Ok(links)
    }

    fn resolve_in(&self, realm: &Realm) -> CoreResult<Option<Self>> {
        check_same_file(&self.realm, realm)?;
        let handle = Self::new(realm.clone(), self.target.clone());
        Ok(handle.is_valid().then_some(handle))
    }

    fn to_results(&self) -> Results {
        Results::collection(self.realm.clone(), self.target.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::realm::{Realm, RealmConfig};
    use crate::schema::{ObjectSchema, Property, PropertyType, Schema};

    /// A realm with one `Holder` object carrying collections of every kind.
    pub fn holder_realm(name: &str) -> (Realm, crate::object::Object) {
        let schema = Schema::new(vec![
            ObjectSchema::new("Holder")
                .property(Property::new("ints", PropertyType::Int).list())
                .property(Property::new("tags", PropertyType::String).set())
                .property(Property::new("nums", PropertyType::Int).nullable().dictionary())
                .property(Property::object("items", "Item").list())
                .property(Property::object("parts", "Part").list())
                .property(Property::new("anys", PropertyType::Mixed).list())
                .property(Property::new("any", PropertyType::Mixed)),
            ObjectSchema::new("Item").property(Property::new("n", PropertyType::Int)),
            ObjectSchema::new("Part")
                .embedded()
                .property(Property::new("label", PropertyType::String)),
        ]);
        let realm = Realm::open(RealmConfig::in_memory(name).schema(schema, 1)).unwrap();
        let holder = realm.write(|r| r.create_object("Holder")).unwrap();
        (realm, holder)
    }
}
