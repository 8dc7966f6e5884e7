//! Schema definitions, validation and diffing.
//!
//! A [`Schema`] is a set of [`ObjectSchema`] classes, each holding stored
//! and computed [`Property`] definitions. [`Schema::compare`] produces the
//! [`SchemaChange`]s needed to turn one schema into another; the realm
//! decides which of them are allowed under its [`crate::SchemaMode`].

mod diff;
mod object_schema;
mod property;

pub use diff::SchemaChange;
pub use object_schema::{ObjectSchema, ObjectType};
pub use property::{CollectionType, Property, PropertyType};

use crate::error::{CoreError, CoreResult};
use crate::types::ClassKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Extra checks applied by [`Schema::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationMode {
    /// Reject embedded classes that no link can reach.
    pub reject_embedded_orphans: bool,
    /// Apply flexible sync rules: top-level classes need an `_id` primary key.
    pub flexible_sync: bool,
}

/// A full set of class definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    classes: Vec<ObjectSchema>,
}

impl Schema {
    /// Builds a schema; classes are kept sorted by name.
    #[must_use]
    pub fn new(mut classes: Vec<ObjectSchema>) -> Self {
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { classes }
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether there are no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Iterates classes in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectSchema> {
        self.classes.iter()
    }

    /// Finds a class by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ObjectSchema> {
        self.classes
            .binary_search_by(|c| c.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.classes[i])
    }

    /// Finds a class by storage key.
    #[must_use]
    pub fn find_by_key(&self, key: ClassKey) -> Option<&ObjectSchema> {
        self.classes.iter().find(|c| c.key == Some(key))
    }

    /// Storage keys of all stored classes.
    #[must_use]
    pub fn class_keys(&self) -> Vec<ClassKey> {
        self.classes.iter().filter_map(|c| c.key).collect()
    }

    /// Checks the schema for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaValidation`] listing every violation.
    pub fn validate(&self, mode: ValidationMode) -> CoreResult<()> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for class in &self.classes {
            if class.name.is_empty() {
                errors.push("class name must not be empty".to_owned());
            }
            if !names.insert(class.name.as_str()) {
                errors.push(format!("class '{}' is declared twice", class.name));
            }
            self.validate_class(class, mode, &mut errors);
        }

        if mode.reject_embedded_orphans {
            for class in self.classes.iter().filter(|c| c.is_embedded()) {
                let reachable = self.classes.iter().any(|origin| {
                    origin.persisted_properties.iter().any(|p| {
                        p.is_link() && p.link_target.as_deref() == Some(class.name.as_str())
                    })
                });
                if !reachable {
                    errors.push(format!(
                        "embedded class '{}' is not the target of any link",
                        class.name
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::SchemaValidation { errors })
        }
    }

    fn validate_class(&self, class: &ObjectSchema, mode: ValidationMode, errors: &mut Vec<String>) {
        let mut props = HashSet::new();
        let mut primaries = 0;

        for prop in class.all_properties() {
            let at = format!("{}.{}", class.name, prop.name);
            if prop.name.is_empty() {
                errors.push(format!("{}: property name must not be empty", class.name));
            }
            if !props.insert(prop.name.as_str()) {
                errors.push(format!("{at}: property is declared twice"));
            }
            if prop.is_primary {
                primaries += 1;
                if !prop.property_type.can_be_primary_key() || prop.is_collection() {
                    errors.push(format!(
                        "{at}: type '{}' cannot be a primary key",
                        prop.type_string()
                    ));
                }
            }
            if prop.is_indexed && !prop.property_type.can_be_indexed() {
                errors.push(format!("{at}: type '{}' cannot be indexed", prop.type_string()));
            }
            if prop.is_fulltext_indexed && prop.property_type != PropertyType::String {
                errors.push(format!("{at}: only strings can be full-text indexed"));
            }
            match prop.property_type {
                PropertyType::Object => self.validate_link(class, prop, &at, errors),
                PropertyType::LinkingObjects => {
                    self.validate_linking_objects(class, prop, &at, errors);
                }
                PropertyType::Mixed if !prop.nullable => {
                    errors.push(format!("{at}: mixed properties must be nullable"));
                }
                _ => {}
            }
        }

        if primaries > 1 {
            errors.push(format!("{}: more than one primary key", class.name));
        }
        if let Some(pk) = &class.primary_key {
            if class.primary_key_property().is_none() {
                errors.push(format!("{}: primary key '{pk}' does not exist", class.name));
            }
        }
        match class.object_type {
            ObjectType::Embedded if class.primary_key.is_some() => {
                errors.push(format!("{}: embedded classes cannot have a primary key", class.name));
            }
            ObjectType::Asymmetric if class.primary_key.is_none() => {
                errors.push(format!("{}: asymmetric classes need a primary key", class.name));
            }
            ObjectType::TopLevel if mode.flexible_sync => {
                if class.primary_key.as_deref() != Some("_id") {
                    errors.push(format!(
                        "{}: synced classes need a primary key named '_id'",
                        class.name
                    ));
                }
            }
            _ => {}
        }
    }

    fn validate_link(&self, class: &ObjectSchema, prop: &Property, at: &str, errors: &mut Vec<String>) {
        let Some(target_name) = prop.link_target.as_deref() else {
            errors.push(format!("{at}: link has no target class"));
            return;
        };
        let Some(target) = self.find(target_name) else {
            errors.push(format!("{at}: target class '{target_name}' does not exist"));
            return;
        };
        match prop.collection_type {
            CollectionType::None if !prop.nullable => {
                errors.push(format!("{at}: to-one links must be nullable"));
            }
            CollectionType::List | CollectionType::Set if prop.nullable => {
                errors.push(format!("{at}: lists and sets of objects cannot be nullable"));
            }
            CollectionType::Set if target.is_embedded() => {
                errors.push(format!("{at}: sets cannot contain embedded objects"));
            }
            _ => {}
        }
        if target.object_type == ObjectType::Asymmetric {
            errors.push(format!("{at}: links to asymmetric classes are not allowed"));
        }
        if class.object_type == ObjectType::Asymmetric && !target.is_embedded() {
            errors.push(format!("{at}: asymmetric classes can only link to embedded objects"));
        }
    }

    fn validate_linking_objects(
        &self,
        class: &ObjectSchema,
        prop: &Property,
        at: &str,
        errors: &mut Vec<String>,
    ) {
        let origin = prop.link_target.as_deref().and_then(|name| self.find(name));
        let origin_prop = origin.and_then(|o| {
            prop.link_origin_property
                .as_deref()
                .and_then(|name| o.property_for_name(name))
        });
        match origin_prop {
            Some(p) if p.is_link() && p.link_target.as_deref() == Some(class.name.as_str()) => {}
            Some(_) => errors.push(format!(
                "{at}: origin property does not link to '{}'",
                class.name
            )),
            None => errors.push(format!("{at}: origin class or property does not exist")),
        }
    }

    /// Changes needed to turn `self` (stored) into `target` (declared).
    #[must_use]
    pub fn compare(&self, target: &Schema) -> Vec<SchemaChange> {
        diff::compare(self, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dog_person() -> Vec<ObjectSchema> {
        vec![
            ObjectSchema::new("Person")
                .property(Property::new("_id", PropertyType::Int).primary_key())
                .property(Property::new("name", PropertyType::String))
                .property(Property::object("dog", "Dog"))
                .property(Property::object("address", "Address")),
            ObjectSchema::new("Dog")
                .property(Property::new("_id", PropertyType::Int).primary_key())
                .property(Property::linking_objects("owners", "Person", "dog")),
            ObjectSchema::new("Address")
                .embedded()
                .property(Property::new("street", PropertyType::String)),
        ]
    }

    #[test]
    fn valid_schema_passes() {
        let schema = Schema::new(dog_person());
        schema.validate(ValidationMode::default()).unwrap();
        schema
            .validate(ValidationMode {
                reject_embedded_orphans: true,
                flexible_sync: true,
            })
            .unwrap();
        assert_eq!(schema.iter().next().unwrap().name, "Address");
    }

    #[test]
    fn missing_link_target_is_reported() {
        let schema = Schema::new(vec![
            ObjectSchema::new("Person").property(Property::object("cat", "Cat")),
        ]);
        let err = schema.validate(ValidationMode::default()).unwrap_err();
        let CoreError::SchemaValidation { errors } = err else {
            panic!("expected validation error");
        };
        assert!(errors[0].contains("'Cat' does not exist"));
    }

    #[test]
    fn invalid_primary_key_type() {
        let schema = Schema::new(vec![ObjectSchema::new("A")
            .property(Property::new("pk", PropertyType::Double).primary_key())]);
        assert!(schema.validate(ValidationMode::default()).is_err());
    }

    #[test]
    fn embedded_class_cannot_have_primary_key() {
        let schema = Schema::new(vec![ObjectSchema::new("A")
            .embedded()
            .property(Property::new("pk", PropertyType::Int).primary_key())]);
        assert!(schema.validate(ValidationMode::default()).is_err());
    }

    #[test]
    fn orphan_embedded_rejected_only_when_asked() {
        let schema = Schema::new(vec![ObjectSchema::new("Lonely")
            .embedded()
            .property(Property::new("x", PropertyType::Int))]);
        schema.validate(ValidationMode::default()).unwrap();
        assert!(schema
            .validate(ValidationMode {
                reject_embedded_orphans: true,
                flexible_sync: false,
            })
            .is_err());
    }

    #[test]
    fn flexible_sync_requires_id_primary_key() {
        let schema = Schema::new(vec![ObjectSchema::new("Task")
            .property(Property::new("name", PropertyType::String))]);
        let flx = ValidationMode {
            flexible_sync: true,
            ..ValidationMode::default()
        };
        assert!(schema.validate(flx).is_err());
    }

    #[test]
    fn linking_objects_must_point_back() {
        let schema = Schema::new(vec![
            ObjectSchema::new("Person").property(Property::new("name", PropertyType::String)),
            ObjectSchema::new("Dog").property(Property::linking_objects("owners", "Person", "name")),
        ]);
        assert!(schema.validate(ValidationMode::default()).is_err());
    }
}
