//! Translation between realm objects and [`SyncOperation`]s.
//!
//! Capturing reads a frozen realm at the version a commit produced and
//! describes every touched top-level object as a full-state upsert or an
//! erase. Applying runs inside a write transaction on the receiving side.
//! Objects without a primary key cannot be addressed across replicas and
//! are skipped in both directions.

use crate::operation::SyncOperation;
use crate::value::{Fields, Payload, PrimaryKeyValue};
use realmdb_core::{
    CollectionType, CommitChanges, CoreResult, Dictionary, List, Object, ObjectId, ObjectSchema,
    ObjectType, PrimaryKey, Property, PropertyType, Realm, Schema, Set, Timestamp, Uuid, Value,
};

/// Wire form of a primary key.
#[must_use]
pub fn wire_key(key: &PrimaryKey) -> PrimaryKeyValue {
    match key {
        PrimaryKey::Null => PrimaryKeyValue::Null,
        PrimaryKey::Int(v) => PrimaryKeyValue::Int(*v),
        PrimaryKey::String(v) => PrimaryKeyValue::String(v.clone()),
        PrimaryKey::ObjectId(v) => PrimaryKeyValue::ObjectId(v.0),
        PrimaryKey::Uuid(v) => PrimaryKeyValue::Uuid(*v.as_bytes()),
    }
}

/// Realm value of a wire primary key.
#[must_use]
pub fn key_value(key: &PrimaryKeyValue) -> Value {
    match key {
        PrimaryKeyValue::Null => Value::Null,
        PrimaryKeyValue::Int(v) => Value::Int(*v),
        PrimaryKeyValue::String(v) => Value::String(v.clone()),
        PrimaryKeyValue::ObjectId(v) => Value::ObjectId(ObjectId(*v)),
        PrimaryKeyValue::Uuid(v) => Value::Uuid(Uuid::from_bytes(*v)),
    }
}

/// Whether objects of `class` can be synchronized.
#[must_use]
pub fn is_syncable(class: &ObjectSchema) -> bool {
    class.object_type != ObjectType::Embedded && class.primary_key.is_some()
}

/// Describes the top-level objects a commit touched.
///
/// `frozen` must be pinned at the version the commit produced. Objects
/// created and erased by the same commit produce nothing.
///
/// # Errors
///
/// Fails when the frozen realm cannot be read.
pub fn capture_commit(frozen: &Realm, changes: &CommitChanges) -> CoreResult<Vec<SyncOperation>> {
    let schema = frozen.schema()?;
    let mut operations = Vec::new();
    for erased in &changes.erased {
        if let Some(key) = &erased.primary_key {
            operations.push(SyncOperation::erase(erased.class_name.clone(), wire_key(key)));
        }
    }
    for link in &changes.modified {
        let Some(class) = schema.find_by_key(link.class) else {
            continue;
        };
        if !is_syncable(class) {
            continue;
        }
        let Ok(object) = frozen.get_object(&class.name, link.key) else {
            continue;
        };
        if let Some(op) = upsert_for(&object, &schema)? {
            operations.push(op);
        }
    }
    Ok(operations)
}

/// A full-state upsert for `object`, or `None` when its class cannot be
/// synchronized.
///
/// # Errors
///
/// Fails when the object cannot be read.
pub fn upsert_for(object: &Object, schema: &Schema) -> CoreResult<Option<SyncOperation>> {
    let name = object.class_name()?;
    let Some(class) = schema.find(&name) else {
        return Ok(None);
    };
    if !is_syncable(class) {
        return Ok(None);
    }
    let Some(key) = object.primary_key()?.as_ref().and_then(PrimaryKey::from_value) else {
        return Ok(None);
    };
    Ok(Some(SyncOperation::Upsert {
        class: name,
        key: wire_key(&key),
        fields: object_fields(object, schema)?,
    }))
}

/// Every stored property of `object` except its primary key.
///
/// # Errors
///
/// Fails when the object cannot be read.
pub fn object_fields(object: &Object, schema: &Schema) -> CoreResult<Fields> {
    let name = object.class_name()?;
    let mut fields = Fields::new();
    let Some(class) = schema.find(&name) else {
        return Ok(fields);
    };
    for property in &class.persisted_properties {
        if property.is_primary {
            continue;
        }
        let payload = match property.collection_type {
            CollectionType::List => list_payload(&object.get_list(&property.name)?, schema)?,
            CollectionType::Set => set_payload(&object.get_set(&property.name)?, schema)?,
            CollectionType::Dictionary => {
                dictionary_payload(&object.get_dictionary(&property.name)?, schema)?
            }
            CollectionType::None => match object.get_value(&property.name)? {
                Value::List => list_payload(&object.get_list(&property.name)?, schema)?,
                Value::Dictionary => {
                    dictionary_payload(&object.get_dictionary(&property.name)?, schema)?
                }
                value => payload_of(object.realm(), schema, &value)?,
            },
        };
        fields.insert(property.name.clone(), payload);
    }
    Ok(fields)
}

fn list_payload(list: &List, schema: &Schema) -> CoreResult<Payload> {
    let mut items = Vec::new();
    for (index, value) in list.values()?.into_iter().enumerate() {
        items.push(match value {
            Value::List => list_payload(&list.get_list(index)?, schema)?,
            Value::Dictionary => dictionary_payload(&list.get_dictionary(index)?, schema)?,
            value => payload_of(list.realm(), schema, &value)?,
        });
    }
    Ok(Payload::List(items))
}

fn set_payload(set: &Set, schema: &Schema) -> CoreResult<Payload> {
    let items = set
        .values()?
        .iter()
        .map(|value| payload_of(set.realm(), schema, value))
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Payload::Set(items))
}

fn dictionary_payload(dictionary: &Dictionary, schema: &Schema) -> CoreResult<Payload> {
    let mut entries = Vec::new();
    for index in 0..dictionary.size()? {
        let (key, value) = dictionary.get(index)?;
        let payload = match value {
            Value::List => list_payload(&dictionary.get_list(&key)?, schema)?,
            Value::Dictionary => dictionary_payload(&dictionary.get_dictionary(&key)?, schema)?,
            value => payload_of(dictionary.realm(), schema, &value)?,
        };
        entries.push((key, payload));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Payload::Dictionary(entries))
}

fn payload_of(realm: &Realm, schema: &Schema, value: &Value) -> CoreResult<Payload> {
    Ok(match value {
        Value::Null | Value::List | Value::Dictionary => Payload::Null,
        Value::Int(v) => Payload::Int(*v),
        Value::Bool(v) => Payload::Bool(*v),
        Value::String(v) => Payload::String(v.clone()),
        Value::Binary(v) => Payload::Binary(v.clone()),
        Value::Timestamp(t) => Payload::Timestamp {
            seconds: t.seconds,
            nanos: t.nanoseconds,
        },
        Value::Float(v) => Payload::Float(*v),
        Value::Double(v) => Payload::Double(*v),
        Value::ObjectId(v) => Payload::ObjectId(v.0),
        Value::Uuid(v) => Payload::Uuid(*v.as_bytes()),
        Value::Link(link) => {
            let Some(target) = schema.find_by_key(link.class) else {
                return Ok(Payload::Null);
            };
            let Ok(object) = realm.get_object(&target.name, link.key) else {
                return Ok(Payload::Null);
            };
            if target.object_type == ObjectType::Embedded {
                Payload::Embedded(object_fields(&object, schema)?)
            } else {
                match object.primary_key()?.as_ref().and_then(PrimaryKey::from_value) {
                    Some(key) => Payload::Link {
                        class: target.name.clone(),
                        key: wire_key(&key),
                    },
                    None => Payload::Null,
                }
            }
        }
    })
}

/// Applies operations to a realm inside its open write transaction.
#[derive(Debug)]
pub struct InstructionApplier<'a> {
    realm: &'a Realm,
    schema: std::sync::Arc<Schema>,
}

impl<'a> InstructionApplier<'a> {
    /// Creates an applier for `realm`, which must be in a write transaction.
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be read.
    pub fn new(realm: &'a Realm) -> CoreResult<Self> {
        Ok(Self {
            realm,
            schema: realm.schema()?,
        })
    }

    /// Applies every operation in order.
    ///
    /// # Errors
    ///
    /// Fails when a write fails; unknown classes and properties are skipped.
    pub fn apply_all<'o>(&self, operations: impl IntoIterator<Item = &'o SyncOperation>) -> CoreResult<()> {
        for op in operations {
            self.apply(op)?;
        }
        Ok(())
    }

    /// Applies one operation.
    ///
    /// # Errors
    ///
    /// Fails when a write fails; unknown classes and properties are skipped.
    pub fn apply(&self, op: &SyncOperation) -> CoreResult<()> {
        let Some(class) = self.schema.find(op.class()) else {
            tracing::debug!(target: "realm.sync", class = op.class(), "skipping unknown class");
            return Ok(());
        };
        if !is_syncable(class) {
            return Ok(());
        }
        match op {
            SyncOperation::Upsert { class, key, fields } => {
                let (object, _) = self
                    .realm
                    .get_or_create_with_primary_key(class, key_value(key))?;
                self.assign(&object, fields)
            }
            SyncOperation::Erase { class, key } => {
                if let Some(object) = self.realm.find_with_primary_key(class, key_value(key))? {
                    object.delete()?;
                }
                Ok(())
            }
        }
    }

    /// Assigns `fields` to `object`.
    ///
    /// # Errors
    ///
    /// Fails when a write fails.
    pub fn assign(&self, object: &Object, fields: &Fields) -> CoreResult<()> {
        let name = object.class_name()?;
        let Some(class) = self.schema.find(&name) else {
            return Ok(());
        };
        for (field, payload) in fields {
            let Some(property) = class.property_for_name(field) else {
                continue;
            };
            if property.is_primary || !property.is_persisted() {
                continue;
            }
            self.assign_property(object, property, payload)?;
        }
        Ok(())
    }

    fn assign_property(&self, object: &Object, property: &Property, payload: &Payload) -> CoreResult<()> {
        let name = property.name.as_str();
        match (property.collection_type, payload) {
            (CollectionType::List, Payload::List(items)) => self.fill_list(&object.get_list(name)?, items),
            (CollectionType::Set, Payload::Set(items)) => {
                let set = object.get_set(name)?;
                set.clear()?;
                for item in items {
                    if let Some(value) = self.value_of(item)? {
                        set.insert(value)?;
                    }
                }
                Ok(())
            }
            (CollectionType::Dictionary, Payload::Dictionary(entries)) => {
                self.fill_dictionary(&object.get_dictionary(name)?, entries)
            }
            (CollectionType::None, Payload::Embedded(fields)) => {
                let child = object.set_embedded(name)?;
                self.assign(&child, fields)
            }
            (CollectionType::None, Payload::List(items)) if property.property_type == PropertyType::Mixed => {
                object.set_collection(name, CollectionType::List)?;
                self.fill_list(&object.get_list(name)?, items)
            }
            (CollectionType::None, Payload::Dictionary(entries))
                if property.property_type == PropertyType::Mixed =>
            {
                object.set_collection(name, CollectionType::Dictionary)?;
                self.fill_dictionary(&object.get_dictionary(name)?, entries)
            }
            (CollectionType::None, scalar) => {
                if let Some(value) = self.value_of(scalar)? {
                    if object.get_value(name)? != value {
                        object.set_value(name, value)?;
                    }
                }
                Ok(())
            }
            _ => {
                tracing::debug!(
                    target: "realm.sync",
                    property = name,
                    "payload does not fit the property shape"
                );
                Ok(())
            }
        }
    }

    fn fill_list(&self, list: &List, items: &[Payload]) -> CoreResult<()> {
        list.clear()?;
        for item in items {
            let index = list.size()?;
            match item {
                Payload::Embedded(fields) => {
                    let child = list.insert_embedded(index)?;
                    self.assign(&child, fields)?;
                }
                Payload::List(nested) => {
                    list.insert_collection(index, CollectionType::List)?;
                    self.fill_list(&list.get_list(index)?, nested)?;
                }
                Payload::Dictionary(entries) => {
                    list.insert_collection(index, CollectionType::Dictionary)?;
                    self.fill_dictionary(&list.get_dictionary(index)?, entries)?;
                }
                scalar => {
                    if let Some(value) = self.value_of(scalar)? {
                        list.push(value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn fill_dictionary(&self, dictionary: &Dictionary, entries: &[(String, Payload)]) -> CoreResult<()> {
        dictionary.clear()?;
        for (key, item) in entries {
            match item {
                Payload::Embedded(fields) => {
                    let child = dictionary.insert_embedded(key)?;
                    self.assign(&child, fields)?;
                }
                Payload::List(nested) => {
                    dictionary.insert_collection(key, CollectionType::List)?;
                    self.fill_list(&dictionary.get_list(key)?, nested)?;
                }
                Payload::Dictionary(nested) => {
                    dictionary.insert_collection(key, CollectionType::Dictionary)?;
                    self.fill_dictionary(&dictionary.get_dictionary(key)?, nested)?;
                }
                scalar => {
                    if let Some(value) = self.value_of(scalar)? {
                        dictionary.insert(key, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Realm value of a scalar or link payload. Links to classes this realm
    /// does not know resolve to `None`; missing targets are created empty
    /// and filled by their own upsert.
    fn value_of(&self, payload: &Payload) -> CoreResult<Option<Value>> {
        Ok(Some(match payload {
            Payload::Null => Value::Null,
            Payload::Int(v) => Value::Int(*v),
            Payload::Bool(v) => Value::Bool(*v),
            Payload::String(v) => Value::String(v.clone()),
            Payload::Binary(v) => Value::Binary(v.clone()),
            Payload::Timestamp { seconds, nanos } => Value::Timestamp(Timestamp::new(*seconds, *nanos)),
            Payload::Float(v) => Value::Float(*v),
            Payload::Double(v) => Value::Double(*v),
            Payload::ObjectId(v) => Value::ObjectId(ObjectId(*v)),
            Payload::Uuid(v) => Value::Uuid(Uuid::from_bytes(*v)),
            Payload::Link { class, key } => {
                if !self.schema.find(class).is_some_and(is_syncable) {
                    return Ok(None);
                }
                let (target, _) = self.realm.get_or_create_with_primary_key(class, key_value(key))?;
                Value::Link(target.as_link())
            }
            Payload::Embedded(_) | Payload::List(_) | Payload::Set(_) | Payload::Dictionary(_) => {
                return Ok(None)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_core::{ObjectSchema, RealmConfig};
    use std::sync::{Arc, Mutex};

    fn schema() -> Schema {
        Schema::new(vec![
            ObjectSchema::new("Person")
                .property(Property::new("_id", PropertyType::Int).primary_key())
                .property(Property::new("name", PropertyType::String))
                .property(Property::object("dog", "Dog").nullable())
                .property(Property::object("address", "Address").nullable())
                .property(Property::new("tags", PropertyType::String).set())
                .property(Property::new("scores", PropertyType::Int).list())
                .property(Property::new("extra", PropertyType::Mixed)),
            ObjectSchema::new("Dog")
                .property(Property::new("_id", PropertyType::String).primary_key())
                .property(Property::new("age", PropertyType::Int)),
            ObjectSchema::new("Address")
                .embedded()
                .property(Property::new("city", PropertyType::String)),
            ObjectSchema::new("Note").property(Property::new("text", PropertyType::String)),
        ])
    }

    fn open(name: &str) -> Realm {
        Realm::open(RealmConfig::in_memory(name).schema(schema(), 1)).unwrap()
    }

    #[test]
    fn captured_objects_apply_to_another_realm() {
        let source = open("instructions-source");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = source.observe_commits(move |event| sink.lock().unwrap().push(event.clone()));
        source
            .write(|r| {
                let dog = r.create_object_with_primary_key("Dog", "rex")?;
                dog.set_value("age", 3)?;
                let person = r.create_object_with_primary_key("Person", 1)?;
                person.set_value("name", "Ann")?;
                person.set_value("dog", dog.as_link())?;
                person.set_embedded("address")?.set_value("city", "Oslo")?;
                person.get_set("tags")?.insert("a")?;
                person.get_list("scores")?.push(7)?;
                person.set_collection("extra", CollectionType::Dictionary)?;
                person.get_dictionary("extra")?.insert("k", 1)?;
                r.create_object("Note")?.set_value("text", "local only")?;
                Ok(())
            })
            .unwrap();
        let mut ops = Vec::new();
        for event in events.lock().unwrap().iter() {
            let frozen = source.freeze_at(event).unwrap();
            ops.extend(capture_commit(&frozen, event.changes()).unwrap());
        }
        assert_eq!(ops.len(), 2, "notes have no primary key");

        let target = open("instructions-target");
        target
            .write(|r| InstructionApplier::new(r)?.apply_all(&ops))
            .unwrap();
        let person = target.find_with_primary_key("Person", 1).unwrap().unwrap();
        assert_eq!(person.get_value("name").unwrap(), Value::from("Ann"));
        let dog = person.get_linked_object("dog").unwrap().unwrap();
        assert_eq!(dog.get_value("age").unwrap(), Value::Int(3));
        let address = person.get_linked_object("address").unwrap().unwrap();
        assert_eq!(address.get_value("city").unwrap(), Value::from("Oslo"));
        assert_eq!(person.get_set("tags").unwrap().values().unwrap(), vec![Value::from("a")]);
        assert_eq!(person.get_list("scores").unwrap().values().unwrap(), vec![Value::Int(7)]);
        assert_eq!(
            person.get_dictionary("extra").unwrap().find("k").unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn erase_removes_and_ignores_missing() {
        let realm = open("instructions-erase");
        realm
            .write(|r| {
                r.create_object_with_primary_key("Dog", "a")?;
                Ok(())
            })
            .unwrap();
        let ops = [
            SyncOperation::erase("Dog", PrimaryKeyValue::String("a".into())),
            SyncOperation::erase("Dog", PrimaryKeyValue::String("missing".into())),
            SyncOperation::erase("Unknown", PrimaryKeyValue::Int(1)),
        ];
        realm
            .write(|r| InstructionApplier::new(r)?.apply_all(&ops))
            .unwrap();
        assert!(realm.find_with_primary_key("Dog", "a").unwrap().is_none());
    }

    #[test]
    fn links_to_missing_objects_create_them() {
        let realm = open("instructions-forward-link");
        let op = SyncOperation::upsert("Person", PrimaryKeyValue::Int(5)).with_field(
            "dog",
            Payload::Link {
                class: "Dog".into(),
                key: PrimaryKeyValue::String("later".into()),
            },
        );
        realm.write(|r| InstructionApplier::new(r)?.apply(&op)).unwrap();
        assert!(realm.find_with_primary_key("Dog", "later").unwrap().is_some());
    }

    #[test]
    fn keys_convert_both_ways() {
        let key = PrimaryKey::String("x".into());
        assert_eq!(wire_key(&key), PrimaryKeyValue::String("x".into()));
        assert_eq!(key_value(&wire_key(&key)), Value::from("x"));
        assert_eq!(key_value(&PrimaryKeyValue::Int(4)), Value::Int(4));
    }
}
