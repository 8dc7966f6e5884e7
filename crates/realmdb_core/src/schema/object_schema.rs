//! Class definitions.

use crate::schema::property::Property;
use crate::types::{ClassKey, PropertyKey};
use serde::{Deserialize, Serialize};

/// Kind of class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObjectType {
    /// Regular, independently addressable class.
    #[default]
    TopLevel,
    /// Owned by exactly one parent object through a link.
    Embedded,
    /// Write-only class synced to the server and never read back.
    Asymmetric,
}

/// Definition of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    /// Class name.
    pub name: String,
    /// Kind of class.
    pub object_type: ObjectType,
    /// Name of the primary key property.
    pub primary_key: Option<String>,
    /// Stored properties.
    pub persisted_properties: Vec<Property>,
    /// Computed properties (linking objects).
    pub computed_properties: Vec<Property>,
    /// Storage key once the class exists in a file.
    pub key: Option<ClassKey>,
}

impl ObjectSchema {
    /// Creates an empty top-level class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_type: ObjectType::TopLevel,
            primary_key: None,
            persisted_properties: Vec::new(),
            computed_properties: Vec::new(),
            key: None,
        }
    }

    /// Adds a property; a property marked primary becomes the primary key.
    #[must_use]
    pub fn property(mut self, property: Property) -> Self {
        if property.is_primary {
            self.primary_key = Some(property.name.clone());
        }
        if property.is_persisted() {
            self.persisted_properties.push(property);
        } else {
            self.computed_properties.push(property);
        }
        self
    }

    /// Makes the class embedded.
    #[must_use]
    pub fn embedded(mut self) -> Self {
        self.object_type = ObjectType::Embedded;
        self
    }

    /// Makes the class asymmetric.
    #[must_use]
    pub fn asymmetric(mut self) -> Self {
        self.object_type = ObjectType::Asymmetric;
        self
    }

    /// Whether instances are embedded.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.object_type == ObjectType::Embedded
    }

    /// Looks up a stored or computed property by internal name.
    #[must_use]
    pub fn property_for_name(&self, name: &str) -> Option<&Property> {
        self.persisted_properties
            .iter()
            .chain(&self.computed_properties)
            .find(|p| p.name == name)
    }

    /// Looks up a property by public alias, falling back to its name.
    #[must_use]
    pub fn property_for_public_name(&self, name: &str) -> Option<&Property> {
        self.persisted_properties
            .iter()
            .chain(&self.computed_properties)
            .find(|p| p.public_name.as_deref() == Some(name))
            .or_else(|| {
                self.property_for_name(name)
                    .filter(|p| p.public_name.is_none())
            })
    }

    /// Looks up a stored property by key.
    #[must_use]
    pub fn property_for_key(&self, key: PropertyKey) -> Option<&Property> {
        self.persisted_properties.iter().find(|p| p.key == key)
    }

    /// The primary key property.
    #[must_use]
    pub fn primary_key_property(&self) -> Option<&Property> {
        self.primary_key
            .as_deref()
            .and_then(|name| self.persisted_properties.iter().find(|p| p.name == name))
    }

    /// All properties, stored first.
    pub fn all_properties(&self) -> impl Iterator<Item = &Property> {
        self.persisted_properties.iter().chain(&self.computed_properties)
    }
}
