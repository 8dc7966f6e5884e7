//! Applies instructions to a working snapshot.
//!
//! Every mutation funnels through [`apply`], both while a write transaction
//! runs and when the commit log is replayed at open. Derived effects (link
//! nullification, cascading deletes of embedded objects, modification
//! stamps) happen here so they replay identically.

use crate::error::{CoreError, CoreResult};
use crate::schema::{ObjectType, Property};
use crate::storage::instruction::{CommitChanges, ErasedObject, Instruction};
use crate::storage::slot::{
    default_value, CollectionPath, Element, ListData, ObjectData, ParentRef, Slot,
};
use crate::storage::snapshot::{may_hold_link_to, SnapshotData};
use crate::storage::table::TableData;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use crate::value::{PrimaryKey, Value};
use std::sync::Arc;

const MAX_PARENT_DEPTH: usize = 1024;

/// Applies `instruction`, stamping touched objects with `stamp`.
pub(crate) fn apply(
    snap: &mut SnapshotData,
    instruction: &Instruction,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    match instruction {
        Instruction::SetSchemaVersion { version } => {
            snap.schema_version = Some(*version);
            changes.schema_changed = true;
        }
        Instruction::AddClass { schema } => {
            let key = schema
                .key
                .ok_or_else(|| CoreError::illegal("class has no storage key"))?;
            snap.next_class_key = snap.next_class_key.max(key.0 + 1);
            for prop in &schema.persisted_properties {
                snap.next_property_key = snap.next_property_key.max(prop.key.0 + 1);
            }
            snap.tables.insert(key, Arc::new(TableData::new(schema.clone())));
            snap.rebuild_schema();
            changes.schema_changed = true;
        }
        Instruction::RemoveClass { class } => {
            if let Some(table) = snap.tables.get(class) {
                for key in table.objects.keys() {
                    changes.modified.remove(&ObjLink::new(*class, *key));
                }
            }
            snap.tables.remove(class);
            snap.rebuild_schema();
            changes.schema_changed = true;
        }
        Instruction::UpdateClass { schema } => update_class(snap, schema, stamp, changes)?,
        Instruction::AddProperty { class, property } => add_property(snap, *class, property)?,
        Instruction::RemoveProperty { class, property } => {
            remove_property(snap, *class, *property, stamp, changes)?;
        }
        Instruction::CreateObject {
            class,
            key,
            primary_key,
        } => create_object(snap, *class, *key, primary_key.as_ref(), stamp, changes)?,
        Instruction::EraseObject { class, key } => {
            erase_object(snap, ObjLink::new(*class, *key), stamp, changes)?;
        }
        Instruction::ClearTable { class } => {
            let keys: Vec<ObjKey> = snap.table(*class)?.objects.keys().copied().collect();
            for key in keys {
                erase_object(snap, ObjLink::new(*class, key), stamp, changes)?;
            }
        }
        Instruction::SetProperty {
            class,
            key,
            property,
            slot,
        } => set_property(snap, *class, *key, *property, slot, stamp, changes)?,
        Instruction::ListInsert {
            path,
            index,
            elem,
            slot,
        } => {
            let list = list_mut(snap, path)?;
            if *index > list.items.len() {
                return Err(CoreError::IndexOutOfBounds {
                    index: *index,
                    size: list.items.len(),
                });
            }
            list.items.insert(
                *index,
                Element {
                    id: *elem,
                    slot: slot.clone(),
                },
            );
            bump_ids(snap, *elem, slot);
            adopt(snap, path, slot)?;
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::ListSet { path, index, slot } => {
            let list = list_mut(snap, path)?;
            let size = list.items.len();
            let element = list
                .items
                .get_mut(*index)
                .ok_or(CoreError::IndexOutOfBounds {
                    index: *index,
                    size,
                })?;
            let old = std::mem::replace(&mut element.slot, slot.clone());
            bump_ids(snap, 0, slot);
            adopt(snap, path, slot)?;
            release(snap, &old, slot, stamp, changes)?;
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::ListErase { path, index } => {
            let list = list_mut(snap, path)?;
            if *index >= list.items.len() {
                return Err(CoreError::IndexOutOfBounds {
                    index: *index,
                    size: list.items.len(),
                });
            }
            let old = list.items.remove(*index);
            release(snap, &old.slot, &Slot::Value(Value::Null), stamp, changes)?;
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::ListMove { path, from, to } => {
            let list = list_mut(snap, path)?;
            let size = list.items.len();
            for index in [*from, *to] {
                if index >= size {
                    return Err(CoreError::IndexOutOfBounds { index, size });
                }
            }
            let element = list.items.remove(*from);
            list.items.insert(*to, element);
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::CollectionClear { path } => {
            let items = match snap.resolve_mut(path)? {
                Slot::List(l) => std::mem::take(&mut l.items),
                Slot::Set(s) => std::mem::take(&mut s.items),
                Slot::Dictionary(d) => std::mem::take(&mut d.entries).into_values().collect(),
                Slot::Value(_) => return Err(CoreError::illegal("not a collection")),
            };
            let old = Slot::List(ListData { id: 0, items });
            release(snap, &old, &Slot::Value(Value::Null), stamp, changes)?;
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::SetInsert { path, elem, value } => {
            let Slot::Set(set) = snap.resolve_mut(path)? else {
                return Err(CoreError::illegal("not a set"));
            };
            if let Err(pos) = set.search(value) {
                set.items.insert(
                    pos,
                    Element {
                        id: *elem,
                        slot: Slot::Value(value.clone()),
                    },
                );
            }
            snap.next_id = snap.next_id.max(elem + 1);
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::SetErase { path, value } => {
            let Slot::Set(set) = snap.resolve_mut(path)? else {
                return Err(CoreError::illegal("not a set"));
            };
            if let Ok(pos) = set.search(value) {
                set.items.remove(pos);
            }
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::DictInsert {
            path,
            key,
            elem,
            slot,
        } => {
            let Slot::Dictionary(dict) = snap.resolve_mut(path)? else {
                return Err(CoreError::illegal("not a dictionary"));
            };
            let old = match dict.entries.get_mut(key) {
                Some(element) => Some(std::mem::replace(&mut element.slot, slot.clone())),
                None => {
                    dict.entries.insert(
                        key.clone(),
                        Element {
                            id: *elem,
                            slot: slot.clone(),
                        },
                    );
                    None
                }
            };
            bump_ids(snap, *elem, slot);
            adopt(snap, path, slot)?;
            if let Some(old) = old {
                release(snap, &old, slot, stamp, changes)?;
            }
            touch(snap, path.class, path.key, stamp, changes)?;
        }
        Instruction::DictErase { path, key } => {
            let Slot::Dictionary(dict) = snap.resolve_mut(path)? else {
                return Err(CoreError::illegal("not a dictionary"));
            };
            if let Some(old) = dict.entries.remove(key) {
                release(snap, &old.slot, &Slot::Value(Value::Null), stamp, changes)?;
            }
            touch(snap, path.class, path.key, stamp, changes)?;
        }
    }
    Ok(())
}

fn list_mut<'a>(
    snap: &'a mut SnapshotData,
    path: &CollectionPath,
) -> CoreResult<&'a mut ListData> {
    match snap.resolve_mut(path)? {
        Slot::List(list) => Ok(list),
        _ => Err(CoreError::invalidated("list was replaced")),
    }
}

fn bump_ids(snap: &mut SnapshotData, elem: u64, slot: &Slot) {
    snap.next_id = snap.next_id.max(elem + 1).max(slot.max_id() + 1);
}

fn is_embedded(snap: &SnapshotData, class: ClassKey) -> bool {
    snap.tables
        .get(&class)
        .is_some_and(|t| t.schema.object_type == ObjectType::Embedded)
}

/// Records `owner` as the parent of any embedded object `slot` links to.
fn adopt(snap: &mut SnapshotData, path: &CollectionPath, slot: &Slot) -> CoreResult<()> {
    set_parent(
        snap,
        slot,
        ParentRef {
            class: path.class,
            key: path.key,
            property: path.property,
        },
    )
}

fn set_parent(snap: &mut SnapshotData, slot: &Slot, parent: ParentRef) -> CoreResult<()> {
    if let Slot::Value(Value::Link(link)) = slot {
        if is_embedded(snap, link.class) {
            snap.object_mut(link.class, link.key)?.parent = Some(parent);
        }
    }
    Ok(())
}

/// Erases embedded objects that `old` owned and `new` no longer holds.
fn release(
    snap: &mut SnapshotData,
    old: &Slot,
    new: &Slot,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let mut dropped = Vec::new();
    old.collect_links(&mut dropped);
    if dropped.is_empty() {
        return Ok(());
    }
    let mut kept = Vec::new();
    new.collect_links(&mut kept);
    for link in dropped {
        if !kept.contains(&link) && is_embedded(snap, link.class) && snap.object_exists(link) {
            erase_object(snap, link, stamp, changes)?;
        }
    }
    Ok(())
}

/// Stamps an object and every owner above it.
pub(crate) fn touch(
    snap: &mut SnapshotData,
    mut class: ClassKey,
    mut key: ObjKey,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    for _ in 0..MAX_PARENT_DEPTH {
        // Owners erased earlier in the same cascade are skipped.
        let Some(obj) = snap
            .tables
            .get_mut(&class)
            .and_then(|t| Arc::make_mut(t).get_mut(key))
        else {
            return Ok(());
        };
        obj.modified_at = stamp;
        match obj.parent {
            Some(parent) => {
                class = parent.class;
                key = parent.key;
            }
            None => {
                changes.modified.insert(ObjLink::new(class, key));
                return Ok(());
            }
        }
    }
    Err(CoreError::illegal("embedded object ownership forms a cycle"))
}

fn create_object(
    snap: &mut SnapshotData,
    class: ClassKey,
    key: ObjKey,
    primary_key: Option<&Value>,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let mut next_id = snap.next_id;
    let table = snap.table_mut(class)?;
    if table.objects.contains_key(&key) {
        return Err(CoreError::illegal(format!("object key {key} already in use")));
    }
    let pk_prop = table.pk_property();
    if pk_prop.is_none() && primary_key.is_some() {
        return Err(CoreError::illegal(format!(
            "class '{}' has no primary key",
            table.schema.name
        )));
    }

    let mut obj = ObjectData::new(stamp);
    for prop in &table.schema.persisted_properties {
        obj.values.insert(prop.key, Slot::default_for(prop, &mut next_id));
    }
    if let (Some(prop), Some(value)) = (pk_prop, primary_key) {
        obj.values.insert(prop, Slot::Value(value.clone()));
    }
    if let Some(prop) = pk_prop {
        let pk = obj.primary_key(Some(prop)).ok_or_else(|| {
            CoreError::illegal(format!("{} cannot be a primary key", obj.value(prop).type_name()))
        })?;
        if table.find_by_pk(&pk).is_some() {
            return Err(CoreError::DuplicatePrimaryKey {
                class: table.schema.name.clone(),
                value: pk.to_string(),
            });
        }
        table.pk_index.insert(pk, key);
    }
    table.objects.insert(key, Arc::new(obj));
    table.next_key = table.next_key.max(key.0 + 1);
    let embedded = table.schema.object_type == ObjectType::Embedded;
    snap.next_id = next_id;

    let link = ObjLink::new(class, key);
    changes.created.insert(link);
    if !embedded {
        changes.modified.insert(link);
    }
    Ok(())
}

/// Erases an object, nullifies links to it and cascades to embedded children.
pub(crate) fn erase_object(
    snap: &mut SnapshotData,
    link: ObjLink,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let class_name = snap.class_name(link.class);
    let table = snap.table_mut(link.class)?;
    let pk_prop = table.pk_property();
    let Some(obj) = table.objects.remove(&link.key) else {
        return Ok(());
    };
    let pk = obj.primary_key(pk_prop);
    if let Some(pk) = &pk {
        if table.pk_index.get(pk) == Some(&link.key) {
            table.pk_index.remove(pk);
        }
    }
    let embedded = table.schema.object_type == ObjectType::Embedded;

    let mut children = Vec::new();
    for slot in obj.values.values() {
        slot.collect_links(&mut children);
    }

    remove_links_to(snap, link, stamp, changes)?;

    for child in children {
        if is_embedded(snap, child.class) && snap.object_exists(child) {
            erase_object(snap, child, stamp, changes)?;
        }
    }

    changes.modified.remove(&link);
    if !changes.created.remove(&link) && !embedded {
        changes.erased.push(ErasedObject {
            link,
            class_name,
            primary_key: pk,
        });
    }
    Ok(())
}

fn remove_links_to(
    snap: &mut SnapshotData,
    target: ObjLink,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let target_name = snap.class_name(target.class);
    let origins = snap.backlinks(target);
    for (class, key, _, _) in origins {
        let props: Vec<PropertyKey> = snap
            .table(class)?
            .schema
            .persisted_properties
            .iter()
            .filter(|p| may_hold_link_to(p, &target_name))
            .map(|p| p.key)
            .collect();
        let obj = snap.object_mut(class, key)?;
        for prop in props {
            if let Some(slot) = obj.values.get_mut(&prop) {
                slot.remove_links_to(target);
            }
        }
        touch(snap, class, key, stamp, changes)?;
    }
    Ok(())
}

fn set_property(
    snap: &mut SnapshotData,
    class: ClassKey,
    key: ObjKey,
    property: PropertyKey,
    slot: &Slot,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let table = snap.table_mut(class)?;
    if table.pk_property() == Some(property) {
        let new_pk = PrimaryKey::from_value(&slot.to_value())
            .ok_or_else(|| CoreError::illegal("invalid primary key value"))?;
        if let Some(existing) = table.find_by_pk(&new_pk) {
            if existing != key {
                return Err(CoreError::DuplicatePrimaryKey {
                    class: table.schema.name.clone(),
                    value: new_pk.to_string(),
                });
            }
        }
        let old_pk = table
            .get(key)
            .and_then(|o| o.primary_key(Some(property)));
        if let Some(old_pk) = old_pk {
            if table.pk_index.get(&old_pk) == Some(&key) {
                table.pk_index.remove(&old_pk);
            }
        }
        table.pk_index.insert(new_pk, key);
    }

    let obj = snap.object_mut(class, key)?;
    let old = obj
        .values
        .insert(property, slot.clone())
        .unwrap_or(Slot::Value(Value::Null));
    bump_ids(snap, 0, slot);
    set_parent(
        snap,
        slot,
        ParentRef {
            class,
            key,
            property,
        },
    )?;
    release(snap, &old, slot, stamp, changes)?;
    touch(snap, class, key, stamp, changes)
}

fn add_property(snap: &mut SnapshotData, class: ClassKey, property: &Property) -> CoreResult<()> {
    let mut next_id = snap.next_id;
    let table = snap.table_mut(class)?;
    for obj in table.objects.values_mut() {
        Arc::make_mut(obj)
            .values
            .insert(property.key, Slot::default_for(property, &mut next_id));
    }
    if property.is_primary {
        table.schema.primary_key = Some(property.name.clone());
    }
    table.schema.persisted_properties.push(property.clone());
    if property.is_primary {
        table.rebuild_pk_index();
    }
    snap.next_id = next_id;
    snap.next_property_key = snap.next_property_key.max(property.key.0 + 1);
    snap.rebuild_schema();
    Ok(())
}

fn remove_property(
    snap: &mut SnapshotData,
    class: ClassKey,
    property: PropertyKey,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let table = snap.table_mut(class)?;
    let mut removed = Vec::new();
    for obj in table.objects.values_mut() {
        if let Some(slot) = Arc::make_mut(obj).values.remove(&property) {
            removed.push(slot);
        }
    }
    let was_primary = table.pk_property() == Some(property);
    table.schema.persisted_properties.retain(|p| p.key != property);
    if was_primary {
        table.schema.primary_key = None;
        table.pk_index.clear();
    }
    snap.rebuild_schema();
    changes.schema_changed = true;
    for slot in removed {
        release(snap, &slot, &Slot::Value(Value::Null), stamp, changes)?;
    }
    Ok(())
}

fn update_class(
    snap: &mut SnapshotData,
    schema: &crate::schema::ObjectSchema,
    stamp: u64,
    changes: &mut CommitChanges,
) -> CoreResult<()> {
    let class = schema
        .key
        .ok_or_else(|| CoreError::illegal("class has no storage key"))?;
    let became_embedded = {
        let table = snap.table(class)?;
        table.schema.object_type != ObjectType::Embedded
            && schema.object_type == ObjectType::Embedded
    };
    let mut owners = Vec::new();
    if became_embedded {
        for key in snap.table(class)?.objects.keys() {
            let incoming = snap.backlinks(ObjLink::new(class, *key));
            match incoming.as_slice() {
                [(origin_class, origin_key, property, 1)] => owners.push((
                    *key,
                    ParentRef {
                        class: *origin_class,
                        key: *origin_key,
                        property: *property,
                    },
                )),
                _ => {
                    return Err(CoreError::migration_failed(format!(
                        "cannot convert '{}' to embedded: object {key} has {} incoming links",
                        schema.name,
                        incoming.iter().map(|o| o.3).sum::<usize>()
                    )))
                }
            }
        }
    }

    let table = snap.table_mut(class)?;
    let newly_required: Vec<&Property> = schema
        .persisted_properties
        .iter()
        .filter(|p| {
            !p.nullable
                && table
                    .schema
                    .property_for_key(p.key)
                    .is_some_and(|old| old.nullable)
        })
        .collect();
    for prop in &newly_required {
        let default = default_value(prop);
        for obj in table.objects.values_mut() {
            if matches!(obj.get(prop.key), Some(Slot::Value(Value::Null))) {
                Arc::make_mut(obj)
                    .values
                    .insert(prop.key, Slot::Value(default.clone()));
            }
        }
    }
    table.schema = schema.clone();
    table.rebuild_pk_index();
    if schema.object_type != ObjectType::Embedded {
        for obj in table.objects.values_mut() {
            if obj.parent.is_some() {
                Arc::make_mut(obj).parent = None;
            }
        }
    }
    snap.rebuild_schema();
    changes.schema_changed = true;

    for (key, parent) in owners {
        snap.object_mut(class, key)?.parent = Some(parent);
        touch(snap, class, key, stamp, changes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, PropertyType};
    use crate::storage::slot::PathElement;
    use crate::types::PropertyKey;

    struct Fixture {
        snap: SnapshotData,
        changes: CommitChanges,
        stamp: u64,
    }

    const PERSON: ClassKey = ClassKey(0);
    const ADDRESS: ClassKey = ClassKey(1);
    const NAME: PropertyKey = PropertyKey(0);
    const FRIENDS: PropertyKey = PropertyKey(1);
    const HOME: PropertyKey = PropertyKey(2);
    const STREET: PropertyKey = PropertyKey(3);
    const ID: PropertyKey = PropertyKey(4);

    impl Fixture {
        fn new() -> Self {
            let mut person = ObjectSchema::new("Person")
                .property(Property::new("name", PropertyType::String))
                .property(Property::object("friends", "Person").list())
                .property(Property::object("home", "Address"))
                .property(Property::new("_id", PropertyType::Int).primary_key());
            person.key = Some(PERSON);
            for (i, p) in person.persisted_properties.iter_mut().enumerate() {
                p.key = [NAME, FRIENDS, HOME, ID][i];
            }
            let mut address = ObjectSchema::new("Address")
                .embedded()
                .property(Property::new("street", PropertyType::String));
            address.key = Some(ADDRESS);
            address.persisted_properties[0].key = STREET;

            let mut fixture = Self {
                snap: SnapshotData::empty(),
                changes: CommitChanges::default(),
                stamp: 2,
            };
            fixture.run(Instruction::AddClass { schema: person });
            fixture.run(Instruction::AddClass { schema: address });
            fixture
        }

        fn run(&mut self, instruction: Instruction) {
            apply(&mut self.snap, &instruction, self.stamp, &mut self.changes).unwrap();
        }

        fn try_run(&mut self, instruction: Instruction) -> CoreResult<()> {
            apply(&mut self.snap, &instruction, self.stamp, &mut self.changes)
        }

        fn person(&mut self, key: i64, pk: i64) -> ObjLink {
            self.run(Instruction::CreateObject {
                class: PERSON,
                key: ObjKey(key),
                primary_key: Some(Value::Int(pk)),
            });
            ObjLink::new(PERSON, ObjKey(key))
        }

        fn friends(&self, of: ObjLink) -> CollectionPath {
            CollectionPath {
                class: of.class,
                key: of.key,
                property: FRIENDS,
                path: Vec::new(),
            }
        }
    }

    #[test]
    fn create_fills_defaults_and_indexes_primary_key() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        let obj = f.snap.object(ann.class, ann.key).unwrap();
        assert_eq!(obj.value(NAME), Value::from(""));
        assert!(matches!(obj.get(FRIENDS), Some(Slot::List(_))));
        assert_eq!(f.snap.table(PERSON).unwrap().find_by_pk(&PrimaryKey::Int(1)), Some(ann.key));
        assert!(f.changes.created.contains(&ann));
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let mut f = Fixture::new();
        f.person(0, 1);
        let err = f
            .try_run(Instruction::CreateObject {
                class: PERSON,
                key: ObjKey(1),
                primary_key: Some(Value::Int(1)),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePrimaryKey { .. }));
        assert_eq!(f.snap.table(PERSON).unwrap().len(), 1);
    }

    #[test]
    fn erasing_target_removes_it_from_lists() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        let bob = f.person(1, 2);
        f.run(Instruction::ListInsert {
            path: f.friends(ann),
            index: 0,
            elem: 100,
            slot: Slot::Value(Value::Link(bob)),
        });
        f.changes = CommitChanges::default();
        f.run(Instruction::EraseObject {
            class: PERSON,
            key: bob.key,
        });
        let Slot::List(list) = f.snap.resolve(&f.friends(ann)).unwrap() else {
            panic!("expected list");
        };
        assert!(list.items.is_empty());
        assert!(f.changes.modified.contains(&ann));
        assert_eq!(f.changes.erased[0].primary_key, Some(PrimaryKey::Int(2)));
        assert!(f.snap.next_id > 100);
    }

    #[test]
    fn replacing_embedded_link_erases_old_child() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        for key in [0, 1] {
            f.run(Instruction::CreateObject {
                class: ADDRESS,
                key: ObjKey(key),
                primary_key: None,
            });
            f.run(Instruction::SetProperty {
                class: PERSON,
                key: ann.key,
                property: HOME,
                slot: Slot::Value(Value::Link(ObjLink::new(ADDRESS, ObjKey(key)))),
            });
        }
        let table = f.snap.table(ADDRESS).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(ObjKey(1)).unwrap().parent.unwrap().key, ann.key);
    }

    #[test]
    fn erasing_owner_cascades_to_embedded() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        f.run(Instruction::CreateObject {
            class: ADDRESS,
            key: ObjKey(0),
            primary_key: None,
        });
        f.run(Instruction::SetProperty {
            class: PERSON,
            key: ann.key,
            property: HOME,
            slot: Slot::Value(Value::Link(ObjLink::new(ADDRESS, ObjKey(0)))),
        });
        f.run(Instruction::EraseObject {
            class: PERSON,
            key: ann.key,
        });
        assert_eq!(f.snap.table(ADDRESS).unwrap().len(), 0);
    }

    #[test]
    fn modifying_embedded_object_stamps_owner() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        f.run(Instruction::CreateObject {
            class: ADDRESS,
            key: ObjKey(0),
            primary_key: None,
        });
        f.run(Instruction::SetProperty {
            class: PERSON,
            key: ann.key,
            property: HOME,
            slot: Slot::Value(Value::Link(ObjLink::new(ADDRESS, ObjKey(0)))),
        });
        f.stamp = 3;
        f.changes = CommitChanges::default();
        f.run(Instruction::SetProperty {
            class: ADDRESS,
            key: ObjKey(0),
            property: STREET,
            slot: Slot::Value(Value::from("Main St")),
        });
        assert_eq!(f.snap.object(PERSON, ann.key).unwrap().modified_at, 3);
        assert_eq!(f.changes.modified.iter().copied().collect::<Vec<_>>(), vec![ann]);
    }

    #[test]
    fn list_move_and_bounds() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        let others: Vec<ObjLink> = (1..4).map(|i| f.person(i, i + 1)).collect();
        for (i, other) in others.iter().enumerate() {
            f.run(Instruction::ListInsert {
                path: f.friends(ann),
                index: i,
                elem: 10 + i as u64,
                slot: Slot::Value(Value::Link(*other)),
            });
        }
        f.run(Instruction::ListMove {
            path: f.friends(ann),
            from: 0,
            to: 2,
        });
        let Slot::List(list) = f.snap.resolve(&f.friends(ann)).unwrap() else {
            panic!("expected list");
        };
        let ids: Vec<u64> = list.items.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![11, 12, 10]);

        let err = f
            .try_run(Instruction::ListErase {
                path: f.friends(ann),
                index: 3,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::IndexOutOfBounds { index: 3, size: 3 }));
    }

    #[test]
    fn stale_nested_path_is_invalidated() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        let mut path = f.friends(ann);
        path.path.push(PathElement::Elem(999));
        assert!(matches!(
            f.snap.resolve(&path),
            Err(CoreError::Invalidated { .. })
        ));
    }

    #[test]
    fn embedded_conversion_requires_single_owner() {
        let mut f = Fixture::new();
        let ann = f.person(0, 1);
        let bob = f.person(1, 2);
        let mut schema = f.snap.table(PERSON).unwrap().schema.clone();
        for owner in [ann, bob] {
            f.run(Instruction::ListInsert {
                path: f.friends(owner),
                index: 0,
                elem: 50 + owner.key.0 as u64,
                slot: Slot::Value(Value::Link(ann)),
            });
        }
        schema.object_type = ObjectType::Embedded;
        schema.primary_key = None;
        let err = f.try_run(Instruction::UpdateClass { schema }).unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
    }
}
