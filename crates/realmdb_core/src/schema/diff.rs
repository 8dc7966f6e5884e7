//! Schema comparison.

use crate::schema::object_schema::{ObjectSchema, ObjectType};
use crate::schema::property::Property;
use crate::schema::Schema;
use std::fmt;

/// One difference between a stored and a declared schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// A class exists only in the declared schema.
    AddTable {
        /// Declared class.
        object: ObjectSchema,
    },
    /// A class exists only in the stored schema.
    RemoveTable {
        /// Class name.
        class: String,
    },
    /// A class changed between top-level, embedded and asymmetric.
    ChangeTableType {
        /// Class name.
        class: String,
        /// Stored kind.
        old: ObjectType,
        /// Declared kind.
        new: ObjectType,
    },
    /// A property exists only in the declared class.
    AddProperty {
        /// Class name.
        class: String,
        /// Declared property.
        property: Property,
    },
    /// A property exists only in the stored class.
    RemoveProperty {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },
    /// A property changed type, collection shape or link target.
    ChangePropertyType {
        /// Class name.
        class: String,
        /// Stored definition.
        old: Property,
        /// Declared definition.
        new: Property,
    },
    /// A required property became nullable.
    MakePropertyNullable {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },
    /// A nullable property became required.
    MakePropertyRequired {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },
    /// The primary key moved to another property (or was dropped).
    ChangePrimaryKey {
        /// Class name.
        class: String,
        /// Declared primary key.
        property: Option<String>,
    },
    /// A search index was added.
    AddIndex {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },
    /// A search index was dropped.
    RemoveIndex {
        /// Class name.
        class: String,
        /// Property name.
        property: String,
    },
}

impl SchemaChange {
    /// Whether the change only adds structure and can be applied without a
    /// migration.
    #[must_use]
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            Self::AddTable { .. }
                | Self::AddProperty { .. }
                | Self::AddIndex { .. }
                | Self::RemoveIndex { .. }
        )
    }

    /// Whether the change removes stored structure.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::RemoveTable { .. } | Self::RemoveProperty { .. })
    }

    /// Whether the change only touches indexes.
    #[must_use]
    pub fn is_index_change(&self) -> bool {
        matches!(self, Self::AddIndex { .. } | Self::RemoveIndex { .. })
    }

    /// Name of the class the change applies to.
    #[must_use]
    pub fn class_name(&self) -> &str {
        match self {
            Self::AddTable { object } => &object.name,
            Self::RemoveTable { class }
            | Self::ChangeTableType { class, .. }
            | Self::AddProperty { class, .. }
            | Self::RemoveProperty { class, .. }
            | Self::ChangePropertyType { class, .. }
            | Self::MakePropertyNullable { class, .. }
            | Self::MakePropertyRequired { class, .. }
            | Self::ChangePrimaryKey { class, .. }
            | Self::AddIndex { class, .. }
            | Self::RemoveIndex { class, .. } => class,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddTable { object } => write!(f, "class '{}' has been added", object.name),
            Self::RemoveTable { class } => write!(f, "class '{class}' has been removed"),
            Self::ChangeTableType { class, old, new } => {
                write!(f, "class '{class}' changed from {old:?} to {new:?}")
            }
            Self::AddProperty { class, property } => {
                write!(f, "property '{class}.{}' has been added", property.name)
            }
            Self::RemoveProperty { class, property } => {
                write!(f, "property '{class}.{property}' has been removed")
            }
            Self::ChangePropertyType { class, old, new } => write!(
                f,
                "property '{class}.{}' has been changed from '{}' to '{}'",
                new.name,
                old.type_string(),
                new.type_string()
            ),
            Self::MakePropertyNullable { class, property } => {
                write!(f, "property '{class}.{property}' has been made optional")
            }
            Self::MakePropertyRequired { class, property } => {
                write!(f, "property '{class}.{property}' has been made required")
            }
            Self::ChangePrimaryKey { class, property } => match property {
                Some(p) => write!(f, "primary key for class '{class}' has changed to '{p}'"),
                None => write!(f, "primary key for class '{class}' has been removed"),
            },
            Self::AddIndex { class, property } => {
                write!(f, "property '{class}.{property}' has been made indexed")
            }
            Self::RemoveIndex { class, property } => {
                write!(f, "property '{class}.{property}' is no longer indexed")
            }
        }
    }
}

pub(super) fn compare(existing: &Schema, target: &Schema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    for declared in target.iter() {
        let Some(stored) = existing.find(&declared.name) else {
            changes.push(SchemaChange::AddTable {
                object: declared.clone(),
            });
            continue;
        };
        compare_class(stored, declared, &mut changes);
    }

    for stored in existing.iter() {
        if target.find(&stored.name).is_none() {
            changes.push(SchemaChange::RemoveTable {
                class: stored.name.clone(),
            });
        }
    }
    changes
}

fn compare_class(stored: &ObjectSchema, declared: &ObjectSchema, changes: &mut Vec<SchemaChange>) {
    let class = &declared.name;
    if stored.object_type != declared.object_type {
        changes.push(SchemaChange::ChangeTableType {
            class: class.clone(),
            old: stored.object_type,
            new: declared.object_type,
        });
    }

    for prop in &declared.persisted_properties {
        let Some(old) = stored.persisted_properties.iter().find(|p| p.name == prop.name) else {
            changes.push(SchemaChange::AddProperty {
                class: class.clone(),
                property: prop.clone(),
            });
            continue;
        };
        if !old.same_layout(prop) {
            changes.push(SchemaChange::ChangePropertyType {
                class: class.clone(),
                old: old.clone(),
                new: prop.clone(),
            });
            continue;
        }
        if old.nullable != prop.nullable {
            let property = prop.name.clone();
            changes.push(if prop.nullable {
                SchemaChange::MakePropertyNullable {
                    class: class.clone(),
                    property,
                }
            } else {
                SchemaChange::MakePropertyRequired {
                    class: class.clone(),
                    property,
                }
            });
        }
        let declared_index = prop.is_indexed || prop.is_primary;
        let stored_index = old.is_indexed || old.is_primary;
        if declared_index != stored_index {
            let property = prop.name.clone();
            changes.push(if declared_index {
                SchemaChange::AddIndex {
                    class: class.clone(),
                    property,
                }
            } else {
                SchemaChange::RemoveIndex {
                    class: class.clone(),
                    property,
                }
            });
        }
    }

    for old in &stored.persisted_properties {
        if !declared.persisted_properties.iter().any(|p| p.name == old.name) {
            changes.push(SchemaChange::RemoveProperty {
                class: class.clone(),
                property: old.name.clone(),
            });
        }
    }

    if stored.primary_key != declared.primary_key {
        changes.push(SchemaChange::ChangePrimaryKey {
            class: class.clone(),
            property: declared.primary_key.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::property::PropertyType;

    fn person(extra: Option<Property>) -> Schema {
        let mut class = ObjectSchema::new("Person")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("name", PropertyType::String));
        if let Some(p) = extra {
            class = class.property(p);
        }
        Schema::new(vec![class])
    }

    #[test]
    fn identical_schemas_have_no_changes() {
        assert!(person(None).compare(&person(None)).is_empty());
    }

    #[test]
    fn added_property_is_additive() {
        let changes = person(None).compare(&person(Some(Property::new("age", PropertyType::Int))));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_additive());
        assert_eq!(changes[0].to_string(), "property 'Person.age' has been added");
    }

    #[test]
    fn removed_property_and_table() {
        let stored = person(Some(Property::new("age", PropertyType::Int)));
        let changes = stored.compare(&Schema::default());
        assert_eq!(changes, vec![SchemaChange::RemoveTable { class: "Person".into() }]);

        let changes = stored.compare(&person(None));
        assert!(matches!(&changes[0], SchemaChange::RemoveProperty { property, .. } if property == "age"));
        assert!(changes[0].is_removal());
    }

    #[test]
    fn type_change_is_not_additive() {
        let stored = person(Some(Property::new("age", PropertyType::Int)));
        let declared = person(Some(Property::new("age", PropertyType::String)));
        let changes = stored.compare(&declared);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].is_additive());
        assert_eq!(
            changes[0].to_string(),
            "property 'Person.age' has been changed from 'int' to 'string'"
        );
    }

    #[test]
    fn nullability_and_index_changes() {
        let stored = person(Some(Property::new("age", PropertyType::Int)));
        let declared = person(Some(Property::new("age", PropertyType::Int).nullable().indexed()));
        let changes = stored.compare(&declared);
        assert!(changes.contains(&SchemaChange::MakePropertyNullable {
            class: "Person".into(),
            property: "age".into()
        }));
        assert!(changes.contains(&SchemaChange::AddIndex {
            class: "Person".into(),
            property: "age".into()
        }));
    }

    #[test]
    fn embedded_transition_detected() {
        let stored = Schema::new(vec![ObjectSchema::new("Address")]);
        let declared = Schema::new(vec![ObjectSchema::new("Address").embedded()]);
        assert_eq!(
            stored.compare(&declared),
            vec![SchemaChange::ChangeTableType {
                class: "Address".into(),
                old: ObjectType::TopLevel,
                new: ObjectType::Embedded
            }]
        );
    }
}
