//! Property definitions.

use crate::types::PropertyKey;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    /// 64-bit integer.
    Int,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Byte blob.
    Binary,
    /// Any value, including nested lists and dictionaries.
    Mixed,
    /// Point in time.
    Timestamp,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Link to an object of `link_target`.
    Object,
    /// Computed inverse of a link property.
    LinkingObjects,
    /// Object identifier.
    ObjectId,
    /// UUID.
    Uuid,
}

impl PropertyType {
    /// Whether values of this type can serve as primary keys.
    #[must_use]
    pub const fn can_be_primary_key(self) -> bool {
        matches!(self, Self::Int | Self::String | Self::ObjectId | Self::Uuid)
    }

    /// Whether a search index can be built over this type.
    #[must_use]
    pub const fn can_be_indexed(self) -> bool {
        matches!(
            self,
            Self::Int
                | Self::Bool
                | Self::String
                | Self::Timestamp
                | Self::ObjectId
                | Self::Uuid
                | Self::Mixed
        )
    }

    /// Whether `value` is a legal non-null value of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Mixed, _) => true,
            (Self::Int, Value::Int(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::String, Value::String(_))
            | (Self::Binary, Value::Binary(_))
            | (Self::Timestamp, Value::Timestamp(_))
            | (Self::Float, Value::Float(_))
            | (Self::Double, Value::Double(_))
            | (Self::ObjectId, Value::ObjectId(_))
            | (Self::Uuid, Value::Uuid(_))
            | (Self::Object, Value::Link(_)) => true,
            _ => false,
        }
    }

    /// Coerces numeric literals into this type where lossless.
    #[must_use]
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (Self::Double, Value::Int(v)) => Value::Double(v as f64),
            (Self::Double, Value::Float(v)) => Value::Double(f64::from(v)),
            (Self::Float, Value::Int(v)) => Value::Float(v as f32),
            (Self::Float, Value::Double(v)) if f64::from(v as f32) == v => Value::Float(v as f32),
            (_, value) => value,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Binary => "data",
            Self::Mixed => "mixed",
            Self::Timestamp => "date",
            Self::Float => "float",
            Self::Double => "double",
            Self::Object => "object",
            Self::LinkingObjects => "linkingObjects",
            Self::ObjectId => "objectId",
            Self::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Collection shape of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CollectionType {
    /// Single value.
    #[default]
    None,
    /// Ordered list with duplicates.
    List,
    /// Unordered set of distinct values.
    Set,
    /// String-keyed dictionary.
    Dictionary,
}

/// A property of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Internal name.
    pub name: String,
    /// Alias exposed to callers when different from `name`.
    pub public_name: Option<String>,
    /// Scalar type.
    pub property_type: PropertyType,
    /// Collection shape.
    pub collection_type: CollectionType,
    /// Whether null is allowed.
    pub nullable: bool,
    /// Whether this is the class's primary key.
    pub is_primary: bool,
    /// Whether a search index is maintained.
    pub is_indexed: bool,
    /// Whether a full-text index is maintained.
    pub is_fulltext_indexed: bool,
    /// Target class of links and linking objects.
    pub link_target: Option<String>,
    /// Origin property of linking objects.
    pub link_origin_property: Option<String>,
    /// Storage key; [`PropertyKey::UNASSIGNED`] until stored.
    pub key: PropertyKey,
}

impl Property {
    /// Creates a required single-valued property.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            public_name: None,
            property_type,
            collection_type: CollectionType::None,
            nullable: property_type == PropertyType::Mixed,
            is_primary: false,
            is_indexed: false,
            is_fulltext_indexed: false,
            link_target: None,
            link_origin_property: None,
            key: PropertyKey::UNASSIGNED,
        }
    }

    /// A to-one link; always nullable.
    pub fn object(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, PropertyType::Object);
        prop.link_target = Some(target.into());
        prop.nullable = true;
        prop
    }

    /// A computed inverse of `origin_class.origin_property`.
    pub fn linking_objects(
        name: impl Into<String>,
        origin_class: impl Into<String>,
        origin_property: impl Into<String>,
    ) -> Self {
        let mut prop = Self::new(name, PropertyType::LinkingObjects);
        prop.collection_type = CollectionType::List;
        prop.link_target = Some(origin_class.into());
        prop.link_origin_property = Some(origin_property.into());
        prop
    }

    /// Allows null.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks as primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Adds a search index.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    /// Adds a full-text index.
    #[must_use]
    pub fn fulltext_indexed(mut self) -> Self {
        self.is_fulltext_indexed = true;
        self
    }

    /// Sets the public alias.
    #[must_use]
    pub fn public_name(mut self, alias: impl Into<String>) -> Self {
        self.public_name = Some(alias.into());
        self
    }

    /// Turns into a list.
    #[must_use]
    pub fn list(mut self) -> Self {
        self.collection_type = CollectionType::List;
        if self.property_type == PropertyType::Object {
            self.nullable = false;
        }
        self
    }

    /// Turns into a set.
    #[must_use]
    pub fn set(mut self) -> Self {
        self.collection_type = CollectionType::Set;
        if self.property_type == PropertyType::Object {
            self.nullable = false;
        }
        self
    }

    /// Turns into a dictionary.
    #[must_use]
    pub fn dictionary(mut self) -> Self {
        self.collection_type = CollectionType::Dictionary;
        self
    }

    /// Whether the property is a collection.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.collection_type != CollectionType::None
    }

    /// Whether the property is stored (not computed).
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.property_type != PropertyType::LinkingObjects
    }

    /// Whether values of the property are links.
    #[must_use]
    pub fn is_link(&self) -> bool {
        self.property_type == PropertyType::Object
    }

    /// The name callers should see.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.public_name.as_deref().unwrap_or(&self.name)
    }

    /// Human readable type, such as `list<int?>` or `Dog`.
    #[must_use]
    pub fn type_string(&self) -> String {
        let scalar = match (&self.property_type, &self.link_target) {
            (PropertyType::Object | PropertyType::LinkingObjects, Some(target)) => target.clone(),
            (ty, _) => ty.to_string(),
        };
        let scalar = if self.nullable && self.property_type != PropertyType::Object {
            format!("{scalar}?")
        } else {
            scalar
        };
        match self.collection_type {
            CollectionType::None => scalar,
            CollectionType::List => format!("list<{scalar}>"),
            CollectionType::Set => format!("set<{scalar}>"),
            CollectionType::Dictionary => format!("dictionary<{scalar}>"),
        }
    }

    /// Whether two definitions describe the same stored layout, ignoring
    /// keys and index flags.
    #[must_use]
    pub fn same_layout(&self, other: &Self) -> bool {
        self.property_type == other.property_type
            && self.collection_type == other.collection_type
            && self.link_target == other.link_target
            && self.link_origin_property == other.link_origin_property
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let prop = Property::new("_id", PropertyType::Int).primary_key().indexed();
        assert!(prop.is_primary);
        assert!(prop.is_indexed);
        assert!(!prop.nullable);
        assert!(!prop.key.is_assigned());
    }

    #[test]
    fn type_strings() {
        assert_eq!(Property::new("a", PropertyType::Int).nullable().list().type_string(), "list<int?>");
        assert_eq!(Property::object("dog", "Dog").type_string(), "Dog");
        assert_eq!(Property::object("dogs", "Dog").list().type_string(), "list<Dog>");
        assert_eq!(Property::new("m", PropertyType::Mixed).type_string(), "mixed?");
    }

    #[test]
    fn list_of_objects_is_not_nullable() {
        let prop = Property::object("dogs", "Dog").list();
        assert!(!prop.nullable);
        assert!(prop.is_link());
    }

    #[test]
    fn float_coercion_keeps_exact_values_only() {
        assert_eq!(PropertyType::Float.coerce(Value::Double(0.5)), Value::Float(0.5));
        assert_eq!(PropertyType::Float.coerce(Value::Double(0.1)), Value::Double(0.1));
        assert_eq!(PropertyType::Double.coerce(Value::Int(3)), Value::Double(3.0));
    }
}
