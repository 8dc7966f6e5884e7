//! Object accessors.
//!
//! An [`Object`] is a handle to one row of a class. It holds no data of its
//! own: every read goes to the version its realm currently sees and every
//! write goes to the realm's open write transaction.

use crate::collections::{mixed_element, CollectionRef, Dictionary, List, Set};
use crate::error::{CoreError, CoreResult};
use crate::notify::notifier::{Notifier, ObjectNotifier};
use crate::notify::{KeyPathArray, NotificationToken, ObjectChangeSet};
use crate::query::Results;
use crate::realm::Realm;
use crate::schema::{CollectionType, ObjectType, Property, PropertyType};
use crate::storage::instruction::Instruction;
use crate::storage::slot::{CollectionPath, ObjectData, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::storage::store::WriteTxn;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use crate::value::{PrimaryKey, Value};
use std::fmt;
use std::sync::Arc;

/// Handle to one object.
#[derive(Debug, Clone)]
pub struct Object {
    realm: Realm,
    link: ObjLink,
}

impl Object {
    pub(crate) fn new(realm: Realm, link: ObjLink) -> Self {
        Self { realm, link }
    }

    /// The realm this handle reads through.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Key of the object within its class.
    #[must_use]
    pub fn key(&self) -> ObjKey {
        self.link.key
    }

    /// Key of the object's class.
    #[must_use]
    pub fn class_key(&self) -> ClassKey {
        self.link.class
    }

    /// A link value pointing at this object.
    #[must_use]
    pub fn as_link(&self) -> ObjLink {
        self.link
    }

    /// Whether the object still exists in the version the realm sees.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.realm
            .read(|snap| Ok(snap.object_exists(self.link)))
            .unwrap_or(false)
    }

    /// Name of the object's class.
    ///
    /// # Errors
    ///
    /// Fails when the realm cannot be read.
    pub fn class_name(&self) -> CoreResult<String> {
        self.realm.read(|snap| Ok(snap.table(self.link.class)?.schema.name.clone()))
    }

    /// The primary key value, if the class has one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the object was deleted.
    pub fn primary_key(&self) -> CoreResult<Option<Value>> {
        self.realm.read(|snap| {
            let table = snap.table(self.link.class)?;
            let obj = data(snap, self.link)?;
            Ok(table.pk_property().map(|p| obj.value(p)))
        })
    }

    /// Reads a single-valued property by name or public name.
    ///
    /// Mixed properties holding a nested collection return
    /// [`Value::List`] or [`Value::Dictionary`].
    ///
    /// # Errors
    ///
    /// Fails for unknown properties, for collection properties (use the
    /// collection accessors) and once the object was deleted.
    pub fn get_value(&self, property: &str) -> CoreResult<Value> {
        self.realm.read(|snap| {
            let property = property_named(snap, self.link.class, property)?;
            read_value(snap, self.link, &property)
        })
    }

    /// Reads a single-valued property by key.
    ///
    /// # Errors
    ///
    /// See [`Self::get_value`].
    pub fn get_value_by_key(&self, property: PropertyKey) -> CoreResult<Value> {
        self.realm.read(|snap| {
            let property = property_keyed(snap, self.link.class, property)?;
            read_value(snap, self.link, &property)
        })
    }

    /// Reads several properties at once.
    ///
    /// # Errors
    ///
    /// See [`Self::get_value`].
    pub fn get_values(&self, properties: &[&str]) -> CoreResult<Vec<Value>> {
        self.realm.read(|snap| {
            properties
                .iter()
                .map(|name| {
                    let property = property_named(snap, self.link.class, name)?;
                    read_value(snap, self.link, &property)
                })
                .collect()
        })
    }

    /// Writes a single-valued property.
    ///
    /// # Errors
    ///
    /// Fails outside a write transaction, for values of the wrong type,
    /// for null on required properties, for links to embedded objects (use
    /// [`Self::set_embedded`]) and when changing the primary key.
    pub fn set_value(&self, property: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.realm.with_txn(|txn| {
            let property = property_named(txn.snapshot(), self.link.class, property)?;
            write_value(txn, self.link, &property, value, false)
        })
    }

    /// Writes a property by key. With `is_default`, writing the value the
    /// property already holds records nothing.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_value_by_key(
        &self,
        property: PropertyKey,
        value: impl Into<Value>,
        is_default: bool,
    ) -> CoreResult<()> {
        let value = value.into();
        self.realm.with_txn(|txn| {
            let property = property_keyed(txn.snapshot(), self.link.class, property)?;
            write_value(txn, self.link, &property, value, is_default)
        })
    }

    /// Writes several properties. Values are validated in order and the
    /// first failure stops the write.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_values(&self, values: Vec<(&str, Value)>) -> CoreResult<()> {
        self.realm.with_txn(|txn| {
            for (name, value) in values {
                let property = property_named(txn.snapshot(), self.link.class, name)?;
                write_value(txn, self.link, &property, value, false)?;
            }
            Ok(())
        })
    }

    /// Adds `delta` to an integer property, wrapping on overflow.
    ///
    /// # Errors
    ///
    /// Fails when the property does not hold an integer.
    pub fn add_int(&self, property: &str, delta: i64) -> CoreResult<i64> {
        self.realm.with_txn(|txn| {
            let property = property_named(txn.snapshot(), self.link.class, property)?;
            let current = read_value(txn.snapshot(), self.link, &property)?;
            let Value::Int(current) = current else {
                return Err(CoreError::PropertyTypeMismatch {
                    property: property.name.clone(),
                    expected: "int".to_owned(),
                    actual: current.type_name().to_owned(),
                });
            };
            let next = current.wrapping_add(delta);
            txn.apply(Instruction::SetProperty {
                class: self.link.class,
                key: self.link.key,
                property: property.key,
                slot: Slot::Value(Value::Int(next)),
            })?;
            Ok(next)
        })
    }

    /// Replaces the embedded object held by a link property with a new
    /// one and returns it. The previous child is deleted.
    ///
    /// # Errors
    ///
    /// Fails unless the property links to an embedded class.
    pub fn set_embedded(&self, property: &str) -> CoreResult<Self> {
        let child = self.realm.with_txn(|txn| {
            let property = property_named(txn.snapshot(), self.link.class, property)?;
            if property.is_collection() {
                return Err(not_single(&property));
            }
            let target = embedded_target(txn.snapshot(), &property)?;
            let child = create_embedded(txn, target)?;
            txn.apply(Instruction::SetProperty {
                class: self.link.class,
                key: self.link.key,
                property: property.key,
                slot: Slot::Value(Value::Link(child)),
            })?;
            Ok(child)
        })?;
        Ok(Self::new(self.realm.clone(), child))
    }

    /// Follows a to-one link property.
    ///
    /// # Errors
    ///
    /// Fails when the property holds something other than a link or null.
    pub fn get_linked_object(&self, property: &str) -> CoreResult<Option<Self>> {
        match self.get_value(property)? {
            Value::Link(link) => Ok(Some(Self::new(self.realm.clone(), link))),
            Value::Null => Ok(None),
            other => Err(CoreError::PropertyTypeMismatch {
                property: property.to_owned(),
                expected: "link".to_owned(),
                actual: other.type_name().to_owned(),
            }),
        }
    }

    /// The object owning this embedded object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the object was deleted.
    pub fn parent(&self) -> CoreResult<Option<Self>> {
        let parent = self.realm.read(|snap| Ok(data(snap, self.link)?.parent))?;
        Ok(parent.map(|p| Self::new(self.realm.clone(), ObjLink::new(p.class, p.key))))
    }

    /// Stores an empty nested list or dictionary in a mixed property,
    /// replacing whatever it held.
    ///
    /// # Errors
    ///
    /// Fails unless the property is a single mixed value and `kind` is
    /// [`CollectionType::List`] or [`CollectionType::Dictionary`].
    pub fn set_collection(&self, property: &str, kind: CollectionType) -> CoreResult<()> {
        self.realm.with_txn(|txn| {
            let property = property_named(txn.snapshot(), self.link.class, property)?;
            if property.property_type != PropertyType::Mixed || property.is_collection() {
                return Err(CoreError::PropertyTypeMismatch {
                    property: property.name.clone(),
                    expected: "mixed".to_owned(),
                    actual: property.type_string(),
                });
            }
            let slot = nested_slot(txn, kind)?;
            txn.apply(Instruction::SetProperty {
                class: self.link.class,
                key: self.link.key,
                property: property.key,
                slot,
            })
        })
    }

    /// The list held by a list property or a mixed property.
    ///
    /// # Errors
    ///
    /// Fails when the property holds no list.
    pub fn get_list(&self, property: &str) -> CoreResult<List> {
        let target = self.collection(property, CollectionType::List)?;
        Ok(List::new(self.realm.clone(), target))
    }

    /// The set held by a set property.
    ///
    /// # Errors
    ///
    /// Fails when the property is not a set.
    pub fn get_set(&self, property: &str) -> CoreResult<Set> {
        let target = self.collection(property, CollectionType::Set)?;
        Ok(Set::new(self.realm.clone(), target))
    }

    /// The dictionary held by a dictionary property or a mixed property.
    ///
    /// # Errors
    ///
    /// Fails when the property holds no dictionary.
    pub fn get_dictionary(&self, property: &str) -> CoreResult<Dictionary> {
        let target = self.collection(property, CollectionType::Dictionary)?;
        Ok(Dictionary::new(self.realm.clone(), target))
    }

    fn collection(&self, name: &str, kind: CollectionType) -> CoreResult<CollectionRef> {
        self.realm.read(|snap| {
            let property = property_named(snap, self.link.class, name)?;
            let element = if property.collection_type == kind {
                property.clone()
            } else if property.property_type == PropertyType::Mixed && !property.is_collection() {
                mixed_element(&property.name)
            } else {
                return Err(CoreError::PropertyTypeMismatch {
                    property: property.name.clone(),
                    expected: format!("{kind:?}").to_lowercase(),
                    actual: property.type_string(),
                });
            };
            let slot = data(snap, self.link)?
                .get(property.key)
                .ok_or_else(|| CoreError::invalidated("property no longer exists"))?;
            let id = match (kind, slot) {
                (CollectionType::List, Slot::List(l)) => l.id,
                (CollectionType::Set, Slot::Set(s)) => s.id,
                (CollectionType::Dictionary, Slot::Dictionary(d)) => d.id,
                _ => {
                    return Err(CoreError::illegal(format!(
                        "'{}' does not hold a {}",
                        property.name,
                        format!("{kind:?}").to_lowercase()
                    )))
                }
            };
            Ok(CollectionRef {
                path: CollectionPath {
                    class: self.link.class,
                    key: self.link.key,
                    property: property.key,
                    path: Vec::new(),
                },
                id,
                element,
            })
        })
    }

    /// Objects of `origin_class` linking here through `origin_property`.
    ///
    /// # Errors
    ///
    /// Fails when the origin property does not exist or cannot link to this
    /// object's class.
    pub fn backlinks(&self, origin_class: &str, origin_property: &str) -> CoreResult<Results> {
        let (origin, property) = self.realm.read(|snap| {
            let origin = snap
                .class_key(origin_class)
                .ok_or_else(|| CoreError::NoSuchClass {
                    name: origin_class.to_owned(),
                })?;
            let property = property_named(snap, origin, origin_property)?;
            let target = snap.class_name(self.link.class);
            if !crate::storage::snapshot::may_hold_link_to(&property, &target) {
                return Err(CoreError::illegal(format!(
                    "{origin_class}.{origin_property} cannot link to {target}"
                )));
            }
            Ok((origin, property.key))
        })?;
        Ok(Results::backlinks(self.realm.clone(), self.link, origin, property))
    }

    /// Deletes the object, its embedded children and every link to it.
    ///
    /// # Errors
    ///
    /// Fails outside a write transaction.
    pub fn delete(&self) -> CoreResult<()> {
        self.realm.with_txn(|txn| {
            tracing::trace!(target: "realm.storage.object", object = %self.link, "delete object");
            txn.apply(Instruction::EraseObject {
                class: self.link.class,
                key: self.link.key,
            })
        })
    }

    /// Calls `callback` with the properties changed by each batch of
    /// commits, and once more when the object is deleted.
    ///
    /// # Errors
    ///
    /// Fails on frozen realms and inside write transactions.
    pub fn add_notification_callback(
        &self,
        key_paths: Option<KeyPathArray>,
        callback: impl FnMut(&ObjectChangeSet) + Send + 'static,
    ) -> CoreResult<NotificationToken> {
        let link = self.link;
        self.realm.add_notifier(move |id, base| {
            if !base.object_exists(link) {
                return Err(CoreError::invalidated("object was deleted"));
            }
            let notifier: Arc<dyn Notifier> = Arc::new(ObjectNotifier::new(
                id,
                link,
                key_paths,
                base,
                Box::new(callback),
            ));
            Ok(notifier)
        })
    }

    /// This object as seen through `realm`, which must use the same file.
    /// `None` when the object does not exist there.
    ///
    /// # Errors
    ///
    /// Fails when `realm` uses another file.
    pub fn resolve_in(&self, realm: &Realm) -> CoreResult<Option<Self>> {
        check_same_file(&self.realm, realm)?;
        let exists = realm.read(|snap| Ok(snap.object_exists(self.link)))?;
        Ok(exists.then(|| Self::new(realm.clone(), self.link)))
    }

    /// Renders the object with all its stored values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the object was deleted.
    pub fn describe(&self) -> CoreResult<String> {
        self.realm.read(|snap| {
            let table = snap.table(self.link.class)?;
            let obj = data(snap, self.link)?;
            let fields: Vec<String> = table
                .schema
                .persisted_properties
                .iter()
                .map(|p| {
                    let rendered = match obj.get(p.key) {
                        Some(Slot::List(l)) => format!("[{} items]", l.items.len()),
                        Some(Slot::Set(s)) => format!("{{{} items}}", s.items.len()),
                        Some(Slot::Dictionary(d)) => format!("{{{} entries}}", d.entries.len()),
                        Some(Slot::Value(v)) => v.to_string(),
                        None => Value::Null.to_string(),
                    };
                    format!("{}: {rendered}", p.display_name())
                })
                .collect();
            Ok(format!("{} {{{}}}", table.schema.name, fields.join(", ")))
        })
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "[invalid object {}]", self.link),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link && Arc::ptr_eq(self.realm.store(), other.realm.store())
    }
}

impl Realm {
    /// Creates an object in a class without a primary key.
    ///
    /// # Errors
    ///
    /// Fails outside a write transaction, for embedded classes and for
    /// classes with a primary key.
    pub fn create_object(&self, class: &str) -> CoreResult<Object> {
        let link = self.with_txn(|txn| {
            let class = class_named(txn.snapshot(), class)?;
            let table = txn.snapshot().table(class)?;
            if table.schema.object_type == ObjectType::Embedded {
                return Err(CoreError::illegal(format!(
                    "embedded class '{}' objects are created through their owner",
                    table.schema.name
                )));
            }
            if table.pk_property().is_some() {
                return Err(CoreError::illegal(format!(
                    "class '{}' has a primary key",
                    table.schema.name
                )));
            }
            insert_object(txn, class, None)
        })?;
        Ok(Object::new(self.clone(), link))
    }

    /// Creates an object with the given primary key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicatePrimaryKey`] when the key is taken, and
    /// fails for classes without a primary key or values of the wrong type.
    pub fn create_object_with_primary_key(
        &self,
        class: &str,
        primary_key: impl Into<Value>,
    ) -> CoreResult<Object> {
        let value = primary_key.into();
        let link = self.with_txn(|txn| {
            let class = class_named(txn.snapshot(), class)?;
            let pk = check_primary_key(txn.snapshot(), class, value)?;
            insert_object(txn, class, Some(pk))
        })?;
        Ok(Object::new(self.clone(), link))
    }

    /// Returns the object with `primary_key`, creating it when missing.
    /// The flag tells whether it was created.
    ///
    /// # Errors
    ///
    /// See [`Self::create_object_with_primary_key`].
    pub fn get_or_create_with_primary_key(
        &self,
        class: &str,
        primary_key: impl Into<Value>,
    ) -> CoreResult<(Object, bool)> {
        let value = primary_key.into();
        let (link, created) = self.with_txn(|txn| {
            let class = class_named(txn.snapshot(), class)?;
            let pk = check_primary_key(txn.snapshot(), class, value)?;
            if let Some(found) = find_pk(txn.snapshot(), class, &pk)? {
                return Ok((found, false));
            }
            Ok((insert_object(txn, class, Some(pk))?, true))
        })?;
        Ok((Object::new(self.clone(), link), created))
    }

    /// The object with `key` in `class`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchObject`] when it does not exist.
    pub fn get_object(&self, class: &str, key: ObjKey) -> CoreResult<Object> {
        let link = self.read(|snap| {
            let class = class_named(snap, class)?;
            snap.require_object(class, key)?;
            Ok(ObjLink::new(class, key))
        })?;
        Ok(Object::new(self.clone(), link))
    }

    /// Looks an object up by primary key.
    ///
    /// # Errors
    ///
    /// Fails for unknown classes, classes without a primary key and values
    /// of the wrong type.
    pub fn find_with_primary_key(
        &self,
        class: &str,
        primary_key: impl Into<Value>,
    ) -> CoreResult<Option<Object>> {
        let value = primary_key.into();
        let found = self.read(|snap| {
            let class = class_named(snap, class)?;
            let pk = check_primary_key(snap, class, value)?;
            find_pk(snap, class, &pk)
        })?;
        Ok(found.map(|link| Object::new(self.clone(), link)))
    }

    /// Every object of `class`, in storage order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSuchClass`] for unknown classes.
    pub fn find_all(&self, class: &str) -> CoreResult<Results> {
        let class = self.read(|snap| class_named(snap, class))?;
        Ok(Results::table(self.clone(), class))
    }
}

pub(crate) fn class_named(snap: &SnapshotData, name: &str) -> CoreResult<ClassKey> {
    snap.class_key(name).ok_or_else(|| CoreError::NoSuchClass {
        name: name.to_owned(),
    })
}

pub(crate) fn property_named(snap: &SnapshotData, class: ClassKey, name: &str) -> CoreResult<Property> {
    let schema = &snap.table(class)?.schema;
    schema
        .property_for_name(name)
        .or_else(|| schema.property_for_public_name(name))
        .cloned()
        .ok_or_else(|| CoreError::NoSuchProperty {
            class: schema.name.clone(),
            property: name.to_owned(),
        })
}

fn property_keyed(snap: &SnapshotData, class: ClassKey, key: PropertyKey) -> CoreResult<Property> {
    let schema = &snap.table(class)?.schema;
    schema
        .property_for_key(key)
        .cloned()
        .ok_or_else(|| CoreError::NoSuchProperty {
            class: schema.name.clone(),
            property: key.to_string(),
        })
}

pub(crate) fn data(snap: &SnapshotData, link: ObjLink) -> CoreResult<&ObjectData> {
    snap.object(link.class, link.key)
        .ok_or_else(|| CoreError::invalidated(format!("object {link} was deleted")))
}

fn not_single(property: &Property) -> CoreError {
    CoreError::illegal(format!(
        "'{}' is a {}; use its collection accessor",
        property.name,
        property.type_string()
    ))
}

fn read_value(snap: &SnapshotData, link: ObjLink, property: &Property) -> CoreResult<Value> {
    if !property.is_persisted() {
        return Err(CoreError::illegal(format!(
            "'{}' is computed; use Object::backlinks",
            property.name
        )));
    }
    if property.is_collection() {
        return Err(not_single(property));
    }
    Ok(data(snap, link)?.value(property.key))
}

fn write_value(
    txn: &mut WriteTxn,
    link: ObjLink,
    property: &Property,
    value: Value,
    is_default: bool,
) -> CoreResult<()> {
    if !property.is_persisted() {
        return Err(CoreError::illegal(format!("'{}' is computed", property.name)));
    }
    if property.is_collection() {
        return Err(not_single(property));
    }
    let value = check_value(txn.snapshot(), property, value)?;
    let current = data(txn.snapshot(), link)?.value(property.key);
    if property.is_primary {
        if current == value {
            return Ok(());
        }
        return Err(CoreError::illegal(format!(
            "primary key '{}' cannot be changed after creation",
            property.name
        )));
    }
    if is_default && current == value {
        return Ok(());
    }
    tracing::trace!(
        target: "realm.storage.object",
        object = %link,
        property = %property.name,
        "set value"
    );
    txn.apply(Instruction::SetProperty {
        class: link.class,
        key: link.key,
        property: property.key,
        slot: Slot::Value(value),
    })
}

/// Validates and coerces a value for `property`, or for one element of it
/// when it is a collection.
pub(crate) fn check_value(snap: &SnapshotData, property: &Property, value: Value) -> CoreResult<Value> {
    if value.is_collection() {
        return Err(CoreError::illegal(format!(
            "nested collections in '{}' are created with set_collection or insert_collection",
            property.name
        )));
    }
    if value.is_null() {
        if property.nullable || property.property_type == PropertyType::Mixed {
            return Ok(value);
        }
        return Err(CoreError::NotNullable {
            property: property.name.clone(),
        });
    }
    let value = property.property_type.coerce(value);
    if !property.property_type.accepts(&value) {
        return Err(CoreError::PropertyTypeMismatch {
            property: property.name.clone(),
            expected: property.type_string(),
            actual: value.type_name().to_owned(),
        });
    }
    if let Value::Link(target) = &value {
        let table = snap.table(target.class)?;
        if let (PropertyType::Object, Some(expected)) = (property.property_type, &property.link_target) {
            if &table.schema.name != expected {
                return Err(CoreError::PropertyTypeMismatch {
                    property: property.name.clone(),
                    expected: expected.clone(),
                    actual: table.schema.name.clone(),
                });
            }
        }
        if table.schema.object_type == ObjectType::Embedded {
            return Err(CoreError::illegal(format!(
                "links to embedded objects of '{}' are created with set_embedded or insert_embedded",
                table.schema.name
            )));
        }
        snap.require_object(target.class, target.key)?;
    }
    Ok(value)
}

/// Class key of the embedded class `property` links to.
pub(crate) fn embedded_target(snap: &SnapshotData, property: &Property) -> CoreResult<ClassKey> {
    let target = match (property.property_type, &property.link_target) {
        (PropertyType::Object, Some(target)) => class_named(snap, target)?,
        _ => {
            return Err(CoreError::PropertyTypeMismatch {
                property: property.name.clone(),
                expected: "link to an embedded class".to_owned(),
                actual: property.type_string(),
            })
        }
    };
    if snap.table(target)?.schema.object_type != ObjectType::Embedded {
        return Err(CoreError::illegal(format!(
            "'{}' does not link to an embedded class",
            property.name
        )));
    }
    Ok(target)
}

/// Creates an unowned embedded object; the caller links it into its owner
/// within the same write.
pub(crate) fn create_embedded(txn: &mut WriteTxn, class: ClassKey) -> CoreResult<ObjLink> {
    insert_object(txn, class, None)
}

/// An empty nested collection of `kind` for a mixed slot.
pub(crate) fn nested_slot(txn: &mut WriteTxn, kind: CollectionType) -> CoreResult<Slot> {
    match kind {
        CollectionType::List => Ok(Slot::empty_list(txn.next_id())),
        CollectionType::Dictionary => Ok(Slot::empty_dictionary(txn.next_id())),
        other => Err(CoreError::illegal(format!(
            "mixed values can only hold lists and dictionaries, not {other:?}"
        ))),
    }
}

fn insert_object(txn: &mut WriteTxn, class: ClassKey, primary_key: Option<Value>) -> CoreResult<ObjLink> {
    let key = ObjKey(txn.snapshot().table(class)?.next_key);
    txn.apply(Instruction::CreateObject {
        class,
        key,
        primary_key,
    })?;
    tracing::trace!(target: "realm.storage.object", class = %class, key = %key, "create object");
    Ok(ObjLink::new(class, key))
}

fn check_primary_key(snap: &SnapshotData, class: ClassKey, value: Value) -> CoreResult<Value> {
    let table = snap.table(class)?;
    let property = table
        .schema
        .primary_key_property()
        .ok_or_else(|| CoreError::illegal(format!("class '{}' has no primary key", table.schema.name)))?;
    check_value(snap, property, value)
}

fn find_pk(snap: &SnapshotData, class: ClassKey, value: &Value) -> CoreResult<Option<ObjLink>> {
    let pk = PrimaryKey::from_value(value)
        .ok_or_else(|| CoreError::illegal(format!("{} cannot be a primary key", value.type_name())))?;
    Ok(snap
        .table(class)?
        .find_by_pk(&pk)
        .map(|key| ObjLink::new(class, key)))
}

pub(crate) fn check_same_file(a: &Realm, b: &Realm) -> CoreResult<()> {
    if Arc::ptr_eq(a.store(), b.store()) {
        Ok(())
    } else {
        Err(CoreError::illegal("the target realm uses another file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::RealmConfig;
    use crate::schema::{ObjectSchema, Schema};

    fn open(name: &str) -> Realm {
        let schema = Schema::new(vec![
            ObjectSchema::new("Person")
                .property(Property::new("_id", PropertyType::Int).primary_key())
                .property(Property::new("name", PropertyType::String))
                .property(Property::new("age", PropertyType::Int))
                .property(Property::new("score", PropertyType::Double).nullable())
                .property(Property::object("dog", "Dog"))
                .property(Property::object("address", "Address"))
                .property(Property::new("any", PropertyType::Mixed)),
            ObjectSchema::new("Dog").property(Property::new("name", PropertyType::String)),
            ObjectSchema::new("Address")
                .embedded()
                .property(Property::new("city", PropertyType::String)),
        ]);
        Realm::open(RealmConfig::in_memory(name).schema(schema, 1)).unwrap()
    }

    #[test]
    fn create_and_read_back() {
        let realm = open("object-create");
        let ann = realm
            .write(|r| {
                let ann = r.create_object_with_primary_key("Person", 1)?;
                ann.set_values(vec![("name", "Ann".into()), ("age", 30.into())])?;
                Ok(ann)
            })
            .unwrap();
        assert_eq!(ann.get_value("name").unwrap(), Value::from("Ann"));
        assert_eq!(ann.get_values(&["age", "score"]).unwrap(), vec![Value::Int(30), Value::Null]);
        assert_eq!(ann.primary_key().unwrap(), Some(Value::Int(1)));
        assert_eq!(ann.to_string(), "Person {_id: 1, name: \"Ann\", age: 30, score: null, dog: null, address: null, any: null}");
    }

    #[test]
    fn duplicate_primary_key_and_get_or_create() {
        let realm = open("object-pk");
        realm.begin_write().unwrap();
        let first = realm.create_object_with_primary_key("Person", 7).unwrap();
        assert!(matches!(
            realm.create_object_with_primary_key("Person", 7),
            Err(CoreError::DuplicatePrimaryKey { .. })
        ));
        let (again, created) = realm.get_or_create_with_primary_key("Person", 7).unwrap();
        assert!(!created);
        assert_eq!(again, first);
        realm.commit().unwrap();
        assert!(realm.find_with_primary_key("Person", 7).unwrap().is_some());
        assert!(realm.find_with_primary_key("Person", 8).unwrap().is_none());
    }

    #[test]
    fn values_are_type_checked() {
        let realm = open("object-types");
        realm.begin_write().unwrap();
        let p = realm.create_object_with_primary_key("Person", 1).unwrap();
        assert!(matches!(
            p.set_value("age", "old"),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
        assert!(matches!(p.set_value("name", Value::Null), Err(CoreError::NotNullable { .. })));
        p.set_value("score", 3).unwrap();
        assert_eq!(p.get_value("score").unwrap(), Value::Double(3.0));
        assert!(p.set_value("_id", 2).is_err());
        let other = realm.create_object_with_primary_key("Person", 2).unwrap();
        assert!(matches!(
            p.set_value("dog", other.as_link()),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
        realm.rollback().unwrap();
    }

    #[test]
    fn add_int_and_links() {
        let realm = open("object-links");
        realm.begin_write().unwrap();
        let p = realm.create_object_with_primary_key("Person", 1).unwrap();
        assert_eq!(p.add_int("age", 5).unwrap(), 5);
        assert_eq!(p.add_int("age", -2).unwrap(), 3);
        let dog = realm.create_object("Dog").unwrap();
        p.set_value("dog", dog.as_link()).unwrap();
        assert_eq!(p.get_linked_object("dog").unwrap(), Some(dog.clone()));
        dog.delete().unwrap();
        assert!(!dog.is_valid());
        assert_eq!(p.get_linked_object("dog").unwrap(), None);
        realm.commit().unwrap();
    }

    #[test]
    fn embedded_objects_belong_to_their_owner() {
        let realm = open("object-embedded");
        realm.begin_write().unwrap();
        assert!(realm.create_object("Address").is_err());
        let p = realm.create_object_with_primary_key("Person", 1).unwrap();
        let home = p.set_embedded("address").unwrap();
        home.set_value("city", "Oslo").unwrap();
        assert_eq!(home.parent().unwrap(), Some(p.clone()));
        assert!(p.set_value("address", home.as_link()).is_err());
        let next = p.set_embedded("address").unwrap();
        assert!(!home.is_valid());
        p.delete().unwrap();
        assert!(!next.is_valid());
        realm.commit().unwrap();
    }

    #[test]
    fn is_default_skips_unchanged_writes() {
        let realm = open("object-default");
        realm
            .write(|r| {
                let p = r.create_object_with_primary_key("Person", 1)?;
                p.set_value("age", 4)
            })
            .unwrap();
        let p = realm.find_with_primary_key("Person", 1).unwrap().unwrap();
        let age = realm.find_property(p.class_key(), "age").unwrap().unwrap().key;
        let touched = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&touched);
        let _sub = realm.observe_commits(move |event| {
            seen.lock().push(event.changes().modified.len());
        });
        realm.write(|_| p.set_value_by_key(age, 4, true)).unwrap();
        realm.write(|_| p.set_value_by_key(age, 4, false)).unwrap();
        assert_eq!(*touched.lock(), vec![0, 1]);
        assert_eq!(p.get_value("age").unwrap(), Value::Int(4));
    }
}
