//! Stored representation of property values and collections.

use crate::schema::{CollectionType, Property, PropertyType};
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use crate::value::{ObjectId, PrimaryKey, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Contents of a property or collection element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Slot {
    Value(Value),
    List(ListData),
    Set(SetData),
    Dictionary(DictData),
}

/// A collection element; `id` is stable across moves and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Element {
    pub id: u64,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ListData {
    pub id: u64,
    pub items: Vec<Element>,
}

/// Items are kept sorted by [`Value::total_cmp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SetData {
    pub id: u64,
    pub items: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DictData {
    pub id: u64,
    pub entries: BTreeMap<String, Element>,
}

/// Owner of an embedded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ParentRef {
    pub class: ClassKey,
    pub key: ObjKey,
    pub property: PropertyKey,
}

/// One stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ObjectData {
    pub values: BTreeMap<PropertyKey, Slot>,
    pub parent: Option<ParentRef>,
    /// Version at which the object or one of its embedded children last changed.
    pub modified_at: u64,
}

/// Addresses a collection: the anchoring property plus a path through
/// nested collections held in mixed slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct CollectionPath {
    pub class: ClassKey,
    pub key: ObjKey,
    pub property: PropertyKey,
    pub path: Vec<PathElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum PathElement {
    /// List element by element id.
    Elem(u64),
    /// Dictionary entry by key.
    Key(String),
}

impl Slot {
    pub fn empty_list(id: u64) -> Self {
        Self::List(ListData {
            id,
            items: Vec::new(),
        })
    }

    pub fn empty_dictionary(id: u64) -> Self {
        Self::Dictionary(DictData {
            id,
            entries: BTreeMap::new(),
        })
    }

    /// Initial contents of `property` on a new object.
    pub fn default_for(property: &Property, next_id: &mut u64) -> Self {
        let mut alloc = || {
            let id = *next_id;
            *next_id += 1;
            id
        };
        match property.collection_type {
            CollectionType::List => Self::empty_list(alloc()),
            CollectionType::Set => Self::Set(SetData {
                id: alloc(),
                items: Vec::new(),
            }),
            CollectionType::Dictionary => Self::empty_dictionary(alloc()),
            CollectionType::None => Self::Value(default_value(property)),
        }
    }

    /// The value seen by callers: nested collections become markers.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::List(_) => Value::List,
            Self::Dictionary(_) => Value::Dictionary,
            Self::Set(_) => Value::Null,
        }
    }

    /// Identity of the collection held by this slot.
    pub fn collection_id(&self) -> Option<u64> {
        match self {
            Self::Value(_) => None,
            Self::List(l) => Some(l.id),
            Self::Set(s) => Some(s.id),
            Self::Dictionary(d) => Some(d.id),
        }
    }

    /// Every link reachable from this slot, recursively.
    pub fn collect_links(&self, out: &mut Vec<ObjLink>) {
        match self {
            Self::Value(Value::Link(link)) => out.push(*link),
            Self::Value(_) => {}
            Self::List(l) => l.items.iter().for_each(|e| e.slot.collect_links(out)),
            Self::Set(s) => s.items.iter().for_each(|e| e.slot.collect_links(out)),
            Self::Dictionary(d) => d.entries.values().for_each(|e| e.slot.collect_links(out)),
        }
    }

    /// Removes every link to `target`. Returns whether anything changed.
    ///
    /// Single values and dictionary values become null; list and set
    /// elements are removed.
    pub fn remove_links_to(&mut self, target: ObjLink) -> bool {
        match self {
            Self::Value(Value::Link(link)) if *link == target => {
                *self = Self::Value(Value::Null);
                true
            }
            Self::Value(_) => false,
            Self::List(l) => remove_from_items(&mut l.items, target),
            Self::Set(s) => remove_from_items(&mut s.items, target),
            Self::Dictionary(d) => {
                let mut changed = false;
                for element in d.entries.values_mut() {
                    changed |= element.slot.remove_links_to(target);
                }
                changed
            }
        }
    }

    /// Number of links to `target` held by this slot.
    pub fn count_links_to(&self, target: ObjLink) -> usize {
        let mut links = Vec::new();
        self.collect_links(&mut links);
        links.into_iter().filter(|l| *l == target).count()
    }

    /// Largest element or collection id used in this slot.
    pub fn max_id(&self) -> u64 {
        let own = self.collection_id().unwrap_or(0);
        let nested = match self {
            Self::Value(_) => 0,
            Self::List(l) => l.items.iter().map(|e| e.id.max(e.slot.max_id())).max().unwrap_or(0),
            Self::Set(s) => s.items.iter().map(|e| e.id).max().unwrap_or(0),
            Self::Dictionary(d) => d
                .entries
                .values()
                .map(|e| e.id.max(e.slot.max_id()))
                .max()
                .unwrap_or(0),
        };
        own.max(nested)
    }
}

fn remove_from_items(items: &mut Vec<Element>, target: ObjLink) -> bool {
    let before = items.len();
    items.retain(|e| e.slot != Slot::Value(Value::Link(target)));
    let mut changed = items.len() != before;
    for element in items.iter_mut() {
        if !matches!(element.slot, Slot::Value(_)) {
            changed |= element.slot.remove_links_to(target);
        }
    }
    changed
}

/// Zero value of a required property, null otherwise.
pub(crate) fn default_value(property: &Property) -> Value {
    if property.nullable {
        return Value::Null;
    }
    match property.property_type {
        PropertyType::Int => Value::Int(0),
        PropertyType::Bool => Value::Bool(false),
        PropertyType::String => Value::String(String::new()),
        PropertyType::Binary => Value::Binary(Vec::new()),
        PropertyType::Timestamp => Value::Timestamp(Timestamp::new(0, 0)),
        PropertyType::Float => Value::Float(0.0),
        PropertyType::Double => Value::Double(0.0),
        PropertyType::ObjectId => Value::ObjectId(ObjectId([0; 12])),
        PropertyType::Uuid => Value::Uuid(Uuid::nil()),
        PropertyType::Mixed | PropertyType::Object | PropertyType::LinkingObjects => Value::Null,
    }
}

impl ObjectData {
    pub fn new(modified_at: u64) -> Self {
        Self {
            values: BTreeMap::new(),
            parent: None,
            modified_at,
        }
    }

    pub fn get(&self, property: PropertyKey) -> Option<&Slot> {
        self.values.get(&property)
    }

    pub fn value(&self, property: PropertyKey) -> Value {
        self.values.get(&property).map_or(Value::Null, Slot::to_value)
    }

    pub fn primary_key(&self, property: Option<PropertyKey>) -> Option<PrimaryKey> {
        property.and_then(|p| PrimaryKey::from_value(&self.value(p)))
    }
}

impl ListData {
    pub fn position(&self, elem: u64) -> Option<usize> {
        self.items.iter().position(|e| e.id == elem)
    }
}

impl SetData {
    /// Index of `value`, or the insertion point that keeps items sorted.
    pub fn search(&self, value: &Value) -> Result<usize, usize> {
        self.items.binary_search_by(|e| e.slot.to_value().total_cmp(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(k: i64) -> ObjLink {
        ObjLink::new(ClassKey(1), ObjKey(k))
    }

    #[test]
    fn defaults_follow_type_and_nullability() {
        let mut next = 10;
        let int = Property::new("a", PropertyType::Int);
        assert_eq!(Slot::default_for(&int, &mut next), Slot::Value(Value::Int(0)));
        let opt = Property::new("a", PropertyType::Int).nullable();
        assert_eq!(Slot::default_for(&opt, &mut next), Slot::Value(Value::Null));
        let list = Property::new("a", PropertyType::Int).list();
        assert_eq!(Slot::default_for(&list, &mut next), Slot::empty_list(10));
        assert_eq!(next, 11);
    }

    #[test]
    fn removing_links_nulls_values_and_drops_list_elements() {
        let mut single = Slot::Value(Value::Link(link(1)));
        assert!(single.remove_links_to(link(1)));
        assert_eq!(single, Slot::Value(Value::Null));

        let mut list = Slot::List(ListData {
            id: 1,
            items: vec![
                Element { id: 2, slot: Slot::Value(Value::Link(link(1))) },
                Element { id: 3, slot: Slot::Value(Value::Link(link(2))) },
                Element { id: 4, slot: Slot::Value(Value::Link(link(1))) },
            ],
        });
        assert!(list.remove_links_to(link(1)));
        assert_eq!(list.count_links_to(link(2)), 1);
        assert_eq!(list.count_links_to(link(1)), 0);
        assert_eq!(list.max_id(), 3);
    }

    #[test]
    fn set_search_keeps_order() {
        let set = SetData {
            id: 1,
            items: vec![
                Element { id: 2, slot: Slot::Value(Value::Int(1)) },
                Element { id: 3, slot: Slot::Value(Value::Int(5)) },
            ],
        };
        assert_eq!(set.search(&Value::Int(5)), Ok(1));
        assert_eq!(set.search(&Value::Int(3)), Err(1));
    }
}
