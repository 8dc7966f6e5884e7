//! Reconciling a declared schema with the stored one.
//!
//! Structural changes run in one write transaction: classes and properties
//! are added first, the migration function runs against both the frozen
//! pre-migration realm and the live one, and undeclared properties are
//! removed last. Any failure rolls the whole transaction back.

use crate::error::{CoreError, CoreResult};
use crate::realm::config::{MigrationFunction, SchemaMode};
use crate::realm::Realm;
use crate::schema::{ObjectSchema, ObjectType, Schema, SchemaChange};
use crate::storage::instruction::Instruction;
use crate::storage::store::WriteTxn;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use std::sync::Arc;

/// Handed to migration functions.
pub struct MigrationContext {
    old_realm: Realm,
    realm: Realm,
    old_schema: Arc<Schema>,
    new_schema: Schema,
}

impl std::fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("old_classes", &self.old_schema.len())
            .field("new_classes", &self.new_schema.len())
            .finish_non_exhaustive()
    }
}

impl MigrationContext {
    /// Frozen view of the data before the migration.
    #[must_use]
    pub fn old_realm(&self) -> &Realm {
        &self.old_realm
    }

    /// The realm being migrated, inside the migration's write transaction.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Schema stored before the migration.
    #[must_use]
    pub fn old_schema(&self) -> &Schema {
        &self.old_schema
    }

    /// Schema being migrated to.
    #[must_use]
    pub fn new_schema(&self) -> &Schema {
        &self.new_schema
    }

    /// Renames a stored property, keeping its data.
    ///
    /// `old_name` must be a stored property absent from the new schema and
    /// `new_name` a declared property of the same type.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NoSuchProperty`] when either side is missing
    /// and [`CoreError::IllegalOperation`] when the types differ.
    pub fn rename_property(&mut self, class: &str, old_name: &str, new_name: &str) -> CoreResult<()> {
        let declared = self
            .new_schema
            .find(class)
            .ok_or_else(|| CoreError::NoSuchClass {
                name: class.to_owned(),
            })?;
        let target = declared
            .property_for_name(new_name)
            .ok_or_else(|| CoreError::NoSuchProperty {
                class: class.to_owned(),
                property: new_name.to_owned(),
            })?
            .clone();
        if declared.property_for_name(old_name).is_some() {
            return Err(CoreError::illegal(format!(
                "cannot rename '{class}.{old_name}': it is still part of the schema"
            )));
        }
        self.realm.with_txn(|txn| {
            let key = class_key(txn, class)?;
            let current = txn.snapshot().table(key)?.schema.clone();
            let old = current
                .property_for_name(old_name)
                .ok_or_else(|| CoreError::NoSuchProperty {
                    class: class.to_owned(),
                    property: old_name.to_owned(),
                })?
                .clone();
            if !old.same_layout(&target) {
                return Err(CoreError::illegal(format!(
                    "cannot rename '{class}.{old_name}' to '{new_name}': type '{}' differs from '{}'",
                    old.type_string(),
                    target.type_string()
                )));
            }
            if let Some(placeholder) = current.property_for_name(new_name) {
                txn.apply(Instruction::RemoveProperty {
                    class: key,
                    property: placeholder.key,
                })?;
            }
            let mut schema = txn.snapshot().table(key)?.schema.clone();
            for property in &mut schema.persisted_properties {
                if property.key == old.key {
                    let stored_key = property.key;
                    *property = target.clone();
                    property.key = stored_key;
                }
            }
            txn.apply(Instruction::UpdateClass { schema })
        })?;
        tracing::debug!(target: "realm", class, old_name, new_name, "renamed property");
        Ok(())
    }

    /// Deletes a stored class that the new schema no longer declares.
    ///
    /// Returns false when no such class is stored.
    ///
    /// # Errors
    ///
    /// Fails when the class is still declared or another class links to it.
    pub fn remove_table(&mut self, class: &str) -> CoreResult<bool> {
        if self.new_schema.find(class).is_some() {
            return Err(CoreError::illegal(format!(
                "cannot remove '{class}': it is still part of the schema"
            )));
        }
        self.realm.with_txn(|txn| {
            let Some(key) = txn.snapshot().class_key(class) else {
                return Ok(false);
            };
            for table in txn.snapshot().tables.values() {
                if table.schema.name == class {
                    continue;
                }
                if let Some(p) = table
                    .schema
                    .persisted_properties
                    .iter()
                    .find(|p| p.link_target.as_deref() == Some(class))
                {
                    return Err(CoreError::illegal(format!(
                        "cannot remove '{class}': '{}.{}' links to it",
                        table.schema.name, p.name
                    )));
                }
            }
            txn.apply(Instruction::RemoveClass { class: key })?;
            Ok(true)
        })
    }
}

impl Realm {
    /// Updates the stored schema to `schema` at `version`, running
    /// `migration` when the version increases.
    ///
    /// The realm's configured [`SchemaMode`] decides which changes are
    /// allowed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaMismatch`] for changes the mode does not
    /// allow, [`CoreError::InvalidSchemaVersion`] when `version` goes
    /// backwards, and any error of the migration function. The stored
    /// schema is untouched on failure.
    pub fn update_schema(
        &self,
        schema: Schema,
        version: u64,
        migration: Option<MigrationFunction>,
    ) -> CoreResult<()> {
        schema.validate(crate::schema::ValidationMode {
            reject_embedded_orphans: false,
            flexible_sync: self.config().sync.is_some_and(|s| s.flexible),
        })?;
        update(self, schema, version, migration)
    }

    /// Version stored by the last schema update, `None` for a new file.
    ///
    /// # Errors
    ///
    /// Fails when called off the realm's thread or after close.
    pub fn persisted_schema_version(&self) -> CoreResult<Option<u64>> {
        self.schema_version()
    }
}

pub(crate) fn apply_declared_schema(realm: &Realm, schema: Schema) -> CoreResult<()> {
    let config = realm.config();
    let (version, migration) = (config.schema_version, config.migration_function.clone());
    update(realm, schema, version, migration)
}

fn mismatch(changes: &[&SchemaChange]) -> CoreError {
    CoreError::SchemaMismatch {
        changes: changes.iter().map(ToString::to_string).collect(),
    }
}

fn update(
    realm: &Realm,
    declared: Schema,
    version: u64,
    migration: Option<MigrationFunction>,
) -> CoreResult<()> {
    let mode = realm.config().schema_mode;
    let stored = realm.schema()?;
    let stored_version = realm.schema_version()?;
    let all_changes = stored.compare(&declared);
    // Undeclared classes stay in the file.
    let changes: Vec<&SchemaChange> = all_changes
        .iter()
        .filter(|c| !matches!(c, SchemaChange::RemoveTable { .. }))
        .collect();

    match mode {
        SchemaMode::Immutable => {
            return if changes.is_empty() {
                Ok(())
            } else {
                Err(mismatch(&changes))
            };
        }
        SchemaMode::ReadOnly => {
            let blocking: Vec<&SchemaChange> = changes
                .iter()
                .copied()
                .filter(|c| !matches!(c, SchemaChange::AddTable { .. }) && !c.is_index_change())
                .collect();
            return if blocking.is_empty() {
                Ok(())
            } else {
                Err(mismatch(&blocking))
            };
        }
        _ => {}
    }

    if let Some(current) = stored_version {
        if version < current && mode != SchemaMode::AdditiveDiscovered {
            return Err(CoreError::InvalidSchemaVersion {
                current,
                requested: version,
            });
        }
    }

    let additive = mode.is_additive();
    let migration_needed: Vec<&SchemaChange> = changes
        .iter()
        .copied()
        .filter(|c| !c.is_additive() && !(additive && c.is_removal()))
        .collect();
    let version_changed = stored_version != Some(version);
    let existing = stored_version.is_some();

    let reset = match mode {
        SchemaMode::SoftResetFile => existing && !migration_needed.is_empty(),
        SchemaMode::HardResetFile => existing && (!migration_needed.is_empty() || version_changed),
        _ => false,
    };
    if !reset {
        match mode {
            SchemaMode::Automatic | SchemaMode::Manual
                if existing && !version_changed && !migration_needed.is_empty() =>
            {
                return Err(mismatch(&migration_needed));
            }
            SchemaMode::AdditiveDiscovered | SchemaMode::AdditiveExplicit
                if !migration_needed.is_empty() =>
            {
                return Err(mismatch(&migration_needed));
            }
            _ => {}
        }
    }
    if changes.is_empty() && !version_changed && !reset {
        return Ok(());
    }

    let run_migration = existing && !reset && version_changed;
    let old_realm = if run_migration {
        Some(realm.freeze()?)
    } else {
        None
    };
    let backlinks = realm.config().automatic_backlink_handling;
    let initialize = (!existing || reset)
        .then(|| realm.config().initialization_function.clone())
        .flatten();

    realm.write(|live| {
        if reset {
            live.with_txn(|txn| {
                let keys: Vec<ClassKey> = txn.snapshot().tables.keys().copied().collect();
                for class in keys {
                    txn.apply(Instruction::RemoveClass { class })?;
                }
                Ok(())
            })?;
        }
        if mode != SchemaMode::Manual {
            live.with_txn(|txn| add_structure(txn, &declared, backlinks))?;
        }
        if version_changed && !(additive && stored_version.is_some_and(|v| v > version)) {
            live.with_txn(|txn| txn.apply(Instruction::SetSchemaVersion { version }))?;
        }

        if let (Some(old_realm), Some(migrate)) = (&old_realm, &migration) {
            let mut context = MigrationContext {
                old_realm: old_realm.clone(),
                realm: live.clone(),
                old_schema: Arc::clone(&stored),
                new_schema: declared.clone(),
            };
            migrate(&mut context).map_err(|err| match err {
                err @ (CoreError::Callback(_) | CoreError::MigrationFailed { .. }) => err,
                other => CoreError::migration_failed(other.to_string()),
            })?;
        }

        if mode == SchemaMode::Manual {
            let now = live.schema()?;
            let left: Vec<SchemaChange> = now
                .compare(&declared)
                .into_iter()
                .filter(|c| !c.is_additive() && !matches!(c, SchemaChange::RemoveTable { .. }))
                .collect();
            if !left.is_empty() {
                return Err(mismatch(&left.iter().collect::<Vec<_>>()));
            }
            live.with_txn(|txn| add_structure(txn, &declared, backlinks))?;
        } else if !additive {
            live.with_txn(|txn| remove_undeclared(txn, &declared))?;
        }
        live.with_txn(|txn| check_primary_keys(txn, &declared))?;

        if let Some(init) = &initialize {
            init(live)?;
        }
        Ok(())
    })?;

    tracing::info!(
        target: "realm",
        path = %realm.path().display(),
        ?mode,
        from = ?stored_version,
        to = version,
        changes = changes.len(),
        reset,
        "schema updated"
    );
    Ok(())
}

fn class_key(txn: &WriteTxn, name: &str) -> CoreResult<ClassKey> {
    txn.snapshot()
        .class_key(name)
        .ok_or_else(|| CoreError::NoSuchClass {
            name: name.to_owned(),
        })
}

/// Adds declared classes and properties and applies flag changes. Stored
/// properties absent from the declaration are kept.
pub(crate) fn add_structure(txn: &mut WriteTxn, declared: &Schema, backlinks: bool) -> CoreResult<()> {
    for class in declared.iter() {
        if txn.snapshot().class_key(&class.name).is_some() {
            continue;
        }
        let mut object = class.clone();
        object.key = Some(ClassKey(txn.snapshot().next_class_key));
        let mut next = txn.snapshot().next_property_key;
        for property in &mut object.persisted_properties {
            property.key = PropertyKey(next);
            next += 1;
        }
        tracing::debug!(target: "realm", class = %object.name, "adding class");
        txn.apply(Instruction::AddClass { schema: object })?;
    }

    for class in declared.iter() {
        let key = class_key(txn, &class.name)?;
        let stored = txn.snapshot().table(key)?.schema.clone();
        for property in &class.persisted_properties {
            match stored.property_for_name(&property.name) {
                Some(old) if old.same_layout(property) => continue,
                Some(old) => txn.apply(Instruction::RemoveProperty {
                    class: key,
                    property: old.key,
                })?,
                None => {}
            }
            let mut added = property.clone();
            added.key = PropertyKey(txn.snapshot().next_property_key);
            txn.apply(Instruction::AddProperty {
                class: key,
                property: added,
            })?;
        }

        let current = txn.snapshot().table(key)?.schema.clone();
        if backlinks
            && current.object_type != ObjectType::Embedded
            && class.object_type == ObjectType::Embedded
        {
            erase_orphans(txn, key)?;
        }
        let merged = merge(&current, class);
        if merged != current {
            txn.apply(Instruction::UpdateClass { schema: merged })?;
        }
    }
    Ok(())
}

/// The declared class laid over the stored one, keeping storage keys and
/// stored properties that are about to be removed.
fn merge(current: &ObjectSchema, declared: &ObjectSchema) -> ObjectSchema {
    let mut merged = declared.clone();
    merged.key = current.key;
    merged.persisted_properties = current
        .persisted_properties
        .iter()
        .map(|stored| match declared.property_for_name(&stored.name) {
            Some(wanted) => {
                let mut property = wanted.clone();
                property.key = stored.key;
                property
            }
            None => {
                let mut property = stored.clone();
                property.is_primary = false;
                property
            }
        })
        .collect();
    merged
}

fn erase_orphans(txn: &mut WriteTxn, class: ClassKey) -> CoreResult<()> {
    let orphans: Vec<ObjKey> = {
        let snap = txn.snapshot();
        snap.table(class)?
            .objects
            .keys()
            .copied()
            .filter(|key| snap.backlinks(ObjLink::new(class, *key)).is_empty())
            .collect()
    };
    if !orphans.is_empty() {
        tracing::debug!(target: "realm", count = orphans.len(), "erasing orphans before embedding");
    }
    for key in orphans {
        txn.apply(Instruction::EraseObject { class, key })?;
    }
    Ok(())
}

fn remove_undeclared(txn: &mut WriteTxn, declared: &Schema) -> CoreResult<()> {
    for class in declared.iter() {
        let key = class_key(txn, &class.name)?;
        let undeclared: Vec<PropertyKey> = txn
            .snapshot()
            .table(key)?
            .schema
            .persisted_properties
            .iter()
            .filter(|p| class.property_for_name(&p.name).is_none())
            .map(|p| p.key)
            .collect();
        for property in undeclared {
            txn.apply(Instruction::RemoveProperty {
                class: key,
                property,
            })?;
        }
    }
    Ok(())
}

fn check_primary_keys(txn: &WriteTxn, declared: &Schema) -> CoreResult<()> {
    for class in declared.iter().filter(|c| c.primary_key.is_some()) {
        let table = txn.snapshot().table(class_key(txn, &class.name)?)?;
        if table.pk_index.len() != table.len() {
            return Err(CoreError::DuplicatePrimaryKey {
                class: class.name.clone(),
                value: "after migration".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::CoreError;
    use crate::realm::{Realm, RealmConfig, SchemaMode};
    use crate::schema::{ObjectSchema, Property, PropertyType, Schema};

    fn person(extra: Option<Property>) -> Schema {
        let mut class = ObjectSchema::new("Person")
            .property(Property::new("_id", PropertyType::Int).primary_key())
            .property(Property::new("name", PropertyType::String));
        if let Some(p) = extra {
            class = class.property(p);
        }
        Schema::new(vec![class])
    }

    fn reopen(config: RealmConfig) -> Result<Realm, CoreError> {
        Realm::open(config)
    }

    #[test]
    fn new_file_stores_schema_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        let realm = Realm::open(RealmConfig::new(&path).schema(person(None), 3)).unwrap();
        assert_eq!(realm.persisted_schema_version().unwrap(), Some(3));
        assert!(realm.find_class("Person").unwrap().is_some());
    }

    #[test]
    fn additive_change_needs_no_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        drop(Realm::open(RealmConfig::new(&path).schema(person(None), 1)).unwrap());
        let age = Property::new("age", PropertyType::Int);
        let realm = reopen(RealmConfig::new(&path).schema(person(Some(age)), 1)).unwrap();
        let class = realm.find_class("Person").unwrap().unwrap();
        assert!(class.property_for_name("age").is_some());
    }

    #[test]
    fn removal_without_version_bump_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        let age = Property::new("age", PropertyType::Int);
        drop(Realm::open(RealmConfig::new(&path).schema(person(Some(age)), 1)).unwrap());
        let err = reopen(RealmConfig::new(&path).schema(person(None), 1)).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { .. }));
        let realm = reopen(RealmConfig::new(&path).schema(person(None), 2)).unwrap();
        let class = realm.find_class("Person").unwrap().unwrap();
        assert!(class.property_for_name("age").is_none());
    }

    #[test]
    fn version_cannot_go_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        drop(Realm::open(RealmConfig::new(&path).schema(person(None), 5)).unwrap());
        let err = reopen(RealmConfig::new(&path).schema(person(None), 4)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidSchemaVersion {
                current: 5,
                requested: 4
            }
        ));
    }

    #[test]
    fn additive_mode_ignores_removals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        let age = Property::new("age", PropertyType::Int);
        drop(Realm::open(RealmConfig::new(&path).schema(person(Some(age)), 1)).unwrap());
        let realm = reopen(
            RealmConfig::new(&path)
                .schema(person(None), 1)
                .schema_mode(SchemaMode::AdditiveExplicit),
        )
        .unwrap();
        let class = realm.find_class("Person").unwrap().unwrap();
        assert!(class.property_for_name("age").is_some());
    }

    #[test]
    fn immutable_mode_rejects_differences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        drop(Realm::open(RealmConfig::new(&path).schema(person(None), 1)).unwrap());
        let age = Property::new("age", PropertyType::Int);
        let err = reopen(
            RealmConfig::new(&path)
                .schema(person(Some(age)), 1)
                .schema_mode(SchemaMode::Immutable),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn failing_migration_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.realm");
        drop(Realm::open(RealmConfig::new(&path).schema(person(None), 1)).unwrap());
        let err = reopen(
            RealmConfig::new(&path)
                .schema(person(Some(Property::new("age", PropertyType::Int))), 2)
                .migration(|_| Err(CoreError::migration_failed("no"))),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
        let realm = reopen(RealmConfig::new(&path)).unwrap();
        assert_eq!(realm.persisted_schema_version().unwrap(), Some(1));
    }
}
