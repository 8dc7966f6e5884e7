//! Writing a copy of a realm to another file.

use crate::error::{CoreError, CoreResult};
use crate::realm::config::RealmConfig;
use crate::realm::coordinator;
use crate::realm::migration::add_structure;
use crate::realm::Realm;
use crate::schema::{Schema, SchemaChange};
use crate::storage::instruction::Instruction;
use crate::storage::slot::{DictData, Element, ListData, SetData, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::storage::store::{write_copy, WriteTxn};
use crate::types::{ObjKey, ObjLink};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};

impl Realm {
    /// Writes the version this realm reads to the file of `target`.
    ///
    /// A missing target receives an exact copy. An existing one is only
    /// written with `merge_with_existing`, in which case classes are added
    /// as needed, objects with a primary key overwrite their counterparts
    /// and all other objects are appended. The target is left untouched on
    /// failure.
    ///
    /// # Errors
    ///
    /// Fails inside a write transaction, for in-memory targets, when the
    /// target exists and merging was not requested, and with
    /// [`CoreError::SchemaMismatch`] when a merge meets incompatible classes.
    pub fn convert(&self, target: &RealmConfig, merge_with_existing: bool) -> CoreResult<()> {
        let source = self.current_snapshot()?;
        if target.in_memory {
            return Err(CoreError::illegal("cannot convert to an in-memory realm"));
        }
        if coordinator::registry_key(&target.path, false) == coordinator::registry_key(self.path(), false) {
            return Err(CoreError::illegal("cannot convert a realm onto itself"));
        }
        if !target.path.exists() {
            if coordinator::is_open(&target.path) {
                return Err(CoreError::DeleteOpenedRealm {
                    path: target.path.clone(),
                });
            }
            write_copy(&target.path, &source)?;
            tracing::info!(
                target: "realm",
                from = %self.path().display(),
                to = %target.path.display(),
                version = %source.version,
                "wrote realm copy"
            );
            return Ok(());
        }
        if !merge_with_existing {
            return Err(CoreError::file_access(
                &target.path,
                "file already exists; pass merge_with_existing to merge into it",
            ));
        }

        let mut config = target.clone();
        config.schema = None;
        config.cache = false;
        let dest = Realm::open(config)?;
        let declared = strip_keys(&source.schema);
        let incompatible: Vec<String> = dest
            .schema()?
            .compare(&declared)
            .iter()
            .filter(|c| !c.is_additive() && !c.is_removal())
            .map(SchemaChange::to_string)
            .collect();
        if !incompatible.is_empty() {
            return Err(CoreError::SchemaMismatch {
                changes: incompatible,
            });
        }
        let copied = dest.write(|dest| {
            dest.with_txn(|txn| {
                add_structure(txn, &declared, false)?;
                copy_objects(txn, &source)
            })
        })?;
        tracing::info!(
            target: "realm",
            from = %self.path().display(),
            to = %target.path.display(),
            objects = copied,
            "merged realm into existing file"
        );
        Ok(())
    }
}

fn strip_keys(schema: &Schema) -> Schema {
    Schema::new(
        schema
            .iter()
            .cloned()
            .map(|mut class| {
                class.key = None;
                class
            })
            .collect(),
    )
}

fn copy_objects(txn: &mut WriteTxn, source: &SnapshotData) -> CoreResult<usize> {
    let mut links: HashMap<ObjLink, ObjLink> = HashMap::new();
    for (class, table) in &source.tables {
        let dest_class = txn
            .snapshot()
            .class_key(&table.schema.name)
            .ok_or_else(|| CoreError::NoSuchClass {
                name: table.schema.name.clone(),
            })?;
        let pk_property = table.pk_property();
        for (key, obj) in &table.objects {
            let pk = obj.primary_key(pk_property);
            let existing = match &pk {
                Some(pk) => txn.snapshot().table(dest_class)?.find_by_pk(pk),
                None => None,
            };
            let dest_key = match existing {
                Some(found) => found,
                None => {
                    let fresh = ObjKey(txn.snapshot().table(dest_class)?.next_key);
                    txn.apply(Instruction::CreateObject {
                        class: dest_class,
                        key: fresh,
                        primary_key: pk.map(|p| p.to_value()),
                    })?;
                    fresh
                }
            };
            links.insert(ObjLink::new(*class, *key), ObjLink::new(dest_class, dest_key));
        }
    }

    for (class, table) in &source.tables {
        for (key, obj) in &table.objects {
            let Some(dest) = links.get(&ObjLink::new(*class, *key)).copied() else {
                continue;
            };
            let dest_schema = txn.snapshot().table(dest.class)?.schema.clone();
            for property in &table.schema.persisted_properties {
                if property.is_primary {
                    continue;
                }
                let (Some(dest_property), Some(slot)) =
                    (dest_schema.property_for_name(&property.name), obj.get(property.key))
                else {
                    continue;
                };
                let slot = remap(slot, &links, txn);
                txn.apply(Instruction::SetProperty {
                    class: dest.class,
                    key: dest.key,
                    property: dest_property.key,
                    slot,
                })?;
            }
        }
    }
    Ok(links.len())
}

/// Rewrites links for the target file and gives collections fresh ids.
fn remap(slot: &Slot, links: &HashMap<ObjLink, ObjLink>, txn: &mut WriteTxn) -> Slot {
    let elements = |items: &[Element], txn: &mut WriteTxn| {
        let mut out = Vec::with_capacity(items.len());
        for element in items {
            out.push(Element {
                id: txn.next_id(),
                slot: remap(&element.slot, links, txn),
            });
        }
        out
    };
    match slot {
        Slot::Value(Value::Link(link)) => {
            Slot::Value(links.get(link).map_or(Value::Null, |l| Value::Link(*l)))
        }
        Slot::Value(value) => Slot::Value(value.clone()),
        Slot::List(list) => Slot::List(ListData {
            id: txn.next_id(),
            items: elements(&list.items, txn),
        }),
        Slot::Set(set) => {
            let id = txn.next_id();
            let mut items = elements(&set.items, txn);
            items.sort_by(|a, b| a.slot.to_value().total_cmp(&b.slot.to_value()));
            Slot::Set(SetData { id, items })
        }
        Slot::Dictionary(dict) => {
            let id = txn.next_id();
            let mut entries = BTreeMap::new();
            for (key, element) in &dict.entries {
                let copied = Element {
                    id: txn.next_id(),
                    slot: remap(&element.slot, links, txn),
                };
                entries.insert(key.clone(), copied);
            }
            Slot::Dictionary(DictData { id, entries })
        }
    }
}
