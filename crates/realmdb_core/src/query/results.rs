use crate::collections::{collection_rows, CollectionRef};
use crate::error::{CoreError, CoreResult};
use crate::notify::diff::Row;
use crate::notify::notifier::{CollectionNotifier, Notifier, RowSource};
use crate::notify::{CollectionChangeSet, KeyPathArray, NotificationToken};
use crate::object::{check_same_file, class_named, property_named, Object};
use crate::query::bind::{AggregateOp, Binder, Descriptor, Domain, Predicate};
use crate::query::eval::aggregate;
use crate::query::Query;
use crate::realm::Realm;
use crate::schema::{Property, PropertyType};
use crate::storage::instruction::Instruction;
use crate::storage::snapshot::SnapshotData;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey, VersionId};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Where the rows of a query come from.
#[derive(Debug, Clone)]
pub(crate) enum Source {
    Table(ClassKey),
    Collection(CollectionRef),
    Backlinks {
        target: ObjLink,
        origin: ClassKey,
        property: PropertyKey,
    },
    /// Rows captured at one version; deleted objects drop out.
    Snapshot {
        rows: Arc<Vec<Row>>,
        origin: Box<Source>,
    },
}

fn object_row(link: ObjLink) -> Row {
    Row {
        id: link.key.0 as u64,
        value: Value::Link(link),
    }
}

impl Source {
    pub fn rows(&self, snap: &SnapshotData) -> CoreResult<Vec<Row>> {
        match self {
            Self::Table(class) => Ok(snap
                .table(*class)
                .map_err(|_| CoreError::invalidated("class was removed"))?
                .objects
                .keys()
                .map(|key| object_row(ObjLink { class: *class, key: *key }))
                .collect()),
            Self::Collection(target) => Ok(collection_rows(target.resolve(snap)?)),
            Self::Backlinks {
                target,
                origin,
                property,
            } => {
                if !snap.object_exists(*target) {
                    return Err(CoreError::invalidated("the linked-to object was deleted"));
                }
                let keys: BTreeSet<ObjKey> = snap
                    .backlinks(*target)
                    .into_iter()
                    .filter(|(class, _, prop, _)| class == origin && prop == property)
                    .map(|(_, key, _, _)| key)
                    .collect();
                Ok(keys
                    .into_iter()
                    .map(|key| object_row(ObjLink { class: *origin, key }))
                    .collect())
            }
            Self::Snapshot { rows, .. } => Ok(rows
                .iter()
                .filter(|row| match &row.value {
                    Value::Link(link) => snap.object_exists(*link),
                    _ => true,
                })
                .cloned()
                .collect()),
        }
    }

    pub fn domain(&self, snap: &SnapshotData) -> CoreResult<Domain> {
        match self {
            Self::Table(class) => Ok(Domain::Objects(*class)),
            Self::Backlinks { origin, .. } => Ok(Domain::Objects(*origin)),
            Self::Collection(target) if target.holds_objects() => {
                let class = target.element.link_target.as_deref().unwrap_or_default();
                Ok(Domain::Objects(class_named(snap, class)?))
            }
            Self::Collection(target) => Ok(Domain::Values(target.element.clone())),
            Self::Snapshot { origin, .. } => origin.domain(snap),
        }
    }

    fn check(&self, snap: &SnapshotData) -> CoreResult<()> {
        match self {
            Self::Table(class) => snap.table(*class).map(|_| ()),
            Self::Collection(target) => target.resolve(snap).map(|_| ()),
            Self::Backlinks { target, .. } => {
                if snap.object_exists(*target) {
                    Ok(())
                } else {
                    Err(CoreError::invalidated("the linked-to object was deleted"))
                }
            }
            Self::Snapshot { .. } => Ok(()),
        }
    }
}

/// One step of a results pipeline, applied in order.
#[derive(Debug, Clone)]
pub(crate) enum Stage {
    Filter(Arc<Predicate>),
    Order(Arc<Descriptor>),
}

pub(crate) fn evaluate(source: &Source, stages: &[Stage], snap: &SnapshotData) -> CoreResult<Vec<Row>> {
    let mut rows = source.rows(snap)?;
    for stage in stages {
        match stage {
            Stage::Filter(predicate) => rows.retain(|row| predicate.eval(snap, &row.value)),
            Stage::Order(descriptor) => descriptor.apply(snap, &mut rows),
        }
    }
    Ok(rows)
}

type Cache = Arc<Mutex<Option<(VersionId, Arc<Vec<Row>>)>>>;

/// An ordered view over objects or values.
///
/// Results are lazy: nothing is evaluated until they are counted, indexed
/// or iterated. Live results re-evaluate whenever the realm moves to a new
/// version; results on a frozen realm and snapshots never change.
#[derive(Clone)]
pub struct Results {
    realm: Realm,
    source: Source,
    stages: Vec<Stage>,
    cache: Cache,
}

impl fmt::Debug for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Results")
            .field("source", &self.source)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl Results {
    pub(crate) fn new(realm: Realm, source: Source, stages: Vec<Stage>) -> Self {
        Self {
            realm,
            source,
            stages,
            cache: Arc::default(),
        }
    }

    pub(crate) fn table(realm: Realm, class: ClassKey) -> Self {
        Self::new(realm, Source::Table(class), Vec::new())
    }

    pub(crate) fn collection(realm: Realm, target: CollectionRef) -> Self {
        Self::new(realm, Source::Collection(target), Vec::new())
    }

    pub(crate) fn backlinks(realm: Realm, target: ObjLink, origin: ClassKey, property: PropertyKey) -> Self {
        Self::new(
            realm,
            Source::Backlinks {
                target,
                origin,
                property,
            },
            Vec::new(),
        )
    }

    pub(crate) fn source(&self) -> &Source {
        &self.source
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn derive(&self, stage: Stage) -> Self {
        let mut stages = self.stages.clone();
        stages.push(stage);
        Self::new(self.realm.clone(), self.source.clone(), stages)
    }

    /// The realm the results read from.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    fn rows(&self) -> CoreResult<Arc<Vec<Row>>> {
        if let Some(version) = self.realm.stable_version() {
            if let Some((cached, rows)) = self.cache.lock().as_ref() {
                if *cached == version {
                    return Ok(Arc::clone(rows));
                }
            }
        }
        let rows = Arc::new(
            self.realm
                .read(|snap| evaluate(&self.source, &self.stages, snap))?,
        );
        if let Some(version) = self.realm.stable_version() {
            *self.cache.lock() = Some((version, Arc::clone(&rows)));
        }
        Ok(rows)
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source collection or
    /// object is gone.
    pub fn count(&self) -> CoreResult<usize> {
        Ok(self.rows()?.len())
    }

    /// The value at `index`; links for object results.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfBounds`] past the end.
    pub fn get(&self, index: usize) -> CoreResult<Value> {
        let rows = self.rows()?;
        rows.get(index)
            .map(|row| row.value.clone())
            .ok_or(CoreError::IndexOutOfBounds {
                index,
                size: rows.len(),
            })
    }

    /// The object at `index`.
    ///
    /// # Errors
    ///
    /// Fails past the end and for results of plain values.
    pub fn get_object(&self, index: usize) -> CoreResult<Object> {
        match self.get(index)? {
            Value::Link(link) => Ok(Object::new(self.realm.clone(), link)),
            other => Err(CoreError::illegal(format!(
                "results hold {} values, not objects",
                other.type_name()
            ))),
        }
    }

    /// All values in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source is gone.
    pub fn values(&self) -> CoreResult<Vec<Value>> {
        Ok(self.rows()?.iter().map(|row| row.value.clone()).collect())
    }

    /// Index of the first row equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source is gone.
    pub fn find(&self, value: impl Into<Value>) -> CoreResult<Option<usize>> {
        let value = value.into();
        Ok(self.rows()?.iter().position(|row| row.value.loose_eq(&value)))
    }

    /// Index of `object`.
    ///
    /// # Errors
    ///
    /// Fails when the object belongs to another file.
    pub fn find_object(&self, object: &Object) -> CoreResult<Option<usize>> {
        check_same_file(&self.realm, object.realm())?;
        self.find(object.as_link())
    }

    /// Narrows the results with a query.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] for malformed or ill-typed queries.
    pub fn filter(&self, query: &str, args: &[Value]) -> CoreResult<Self> {
        Ok(Query::parse_for_results(self, query, args)?.find_all())
    }

    /// Sorts by `(key path, ascending)` pairs. Ties keep their current order.
    ///
    /// # Errors
    ///
    /// Fails for unknown or to-many key paths.
    pub fn sort(&self, keys: &[(&str, bool)]) -> CoreResult<Self> {
        let keys = self.bind_paths(keys.iter().map(|(path, _)| *path))?
            .into_iter()
            .zip(keys.iter().map(|(_, ascending)| *ascending))
            .collect();
        Ok(self.derive(Stage::Order(Arc::new(Descriptor::Sort(keys)))))
    }

    /// Keeps the first row of each distinct combination of `paths`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or to-many key paths.
    pub fn distinct(&self, paths: &[&str]) -> CoreResult<Self> {
        let paths = self.bind_paths(paths.iter().copied())?;
        Ok(self.derive(Stage::Order(Arc::new(Descriptor::Distinct(paths)))))
    }

    /// Keeps at most `n` rows.
    #[must_use]
    pub fn limit(&self, n: usize) -> Self {
        self.derive(Stage::Order(Arc::new(Descriptor::Limit(n))))
    }

    fn bind_paths<'a>(
        &self,
        paths: impl Iterator<Item = &'a str>,
    ) -> CoreResult<Vec<crate::query::bind::KeyPath>> {
        self.realm.read(|snap| {
            let domain = self.source.domain(snap)?;
            let binder = Binder::new(snap, &domain, &[]);
            paths.map(|path| binder.ordering_path(path)).collect()
        })
    }

    /// Results fixed to the rows matching now. Objects deleted later drop
    /// out; nothing is added or reordered.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source is gone.
    pub fn snapshot(&self) -> CoreResult<Self> {
        let rows = self.rows()?;
        Ok(Self::new(
            self.realm.clone(),
            Source::Snapshot {
                rows,
                origin: Box::new(self.source.clone()),
            },
            Vec::new(),
        ))
    }

    /// These results on a frozen copy of the realm.
    ///
    /// # Errors
    ///
    /// Fails inside a write transaction.
    pub fn freeze(&self) -> CoreResult<Self> {
        let frozen = self.realm.freeze()?;
        Ok(Self::new(frozen, self.source.clone(), self.stages.clone()))
    }

    /// These results as seen through `realm`.
    ///
    /// # Errors
    ///
    /// Fails when `realm` uses another file and with
    /// [`CoreError::Invalidated`] when the source does not exist there.
    pub fn resolve_in(&self, realm: &Realm) -> CoreResult<Self> {
        check_same_file(&self.realm, realm)?;
        realm.read(|snap| self.source.check(snap))?;
        Ok(Self::new(realm.clone(), self.source.clone(), self.stages.clone()))
    }

    /// Whether the realm is open and the source still exists.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.realm.read(|snap| self.source.check(snap)).is_ok()
    }

    /// Class of the objects in these results, if they hold objects.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source is gone.
    pub fn class_name(&self) -> CoreResult<Option<String>> {
        self.realm.read(|snap| {
            Ok(match self.source.domain(snap)? {
                Domain::Objects(class) => Some(snap.class_name(class)),
                Domain::Values(_) => None,
            })
        })
    }

    /// The query these results evaluate.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the source is gone.
    pub fn get_query(&self) -> CoreResult<Query> {
        Query::from_stages(self.realm.clone(), self.source.clone(), &self.stages)
    }

    /// Deletes every object in the results. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Fails outside a write and for results of plain values.
    pub fn delete_all(&self) -> CoreResult<usize> {
        let rows = self.rows()?;
        let links = rows
            .iter()
            .map(|row| {
                row.value
                    .as_link()
                    .ok_or_else(|| CoreError::illegal("only results of objects can be deleted"))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        self.realm.with_txn(|txn| {
            let mut deleted = 0;
            for link in links {
                if txn.snapshot().object_exists(link) {
                    txn.apply(Instruction::EraseObject {
                        class: link.class,
                        key: link.key,
                    })?;
                    deleted += 1;
                }
            }
            tracing::trace!(target: "realm.storage.query", deleted, "deleted query results");
            Ok(deleted)
        })
    }

    fn column(&self, property: Option<&str>, op: AggregateOp) -> CoreResult<Vec<Value>> {
        let rows = self.rows()?;
        let key = self.realm.read(|snap| {
            let (property, key) = match (self.source.domain(snap)?, property) {
                (Domain::Objects(class), Some(name)) => {
                    let property = property_named(snap, class, name)?;
                    let key = property.key;
                    (property, Some(key))
                }
                (Domain::Objects(_), None) => {
                    return Err(CoreError::illegal("aggregates over objects need a property"))
                }
                (Domain::Values(element), None) => (element, None),
                (Domain::Values(_), Some(name)) => {
                    return Err(CoreError::illegal(format!(
                        "results of values have no property '{name}'"
                    )))
                }
            };
            check_aggregatable(&property, key.is_some(), op)?;
            Ok(key)
        })?;
        let Some(key) = key else {
            return Ok(rows.iter().map(|row| row.value.clone()).collect());
        };
        self.realm.read(|snap| {
            Ok(rows
                .iter()
                .map(|row| {
                    row.value
                        .as_link()
                        .and_then(|link| snap.object(link.class, link.key))
                        .map_or(Value::Null, |obj| obj.value(key))
                })
                .collect())
        })
    }

    fn aggregate(&self, property: Option<&str>, op: AggregateOp) -> CoreResult<Option<Value>> {
        let values = self.column(property, op)?;
        Ok(aggregate(op, values.into_iter()))
    }

    /// Smallest non-null value, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Fails for non-numeric, non-timestamp properties.
    pub fn min(&self, property: Option<&str>) -> CoreResult<Option<Value>> {
        self.aggregate(property, AggregateOp::Min)
    }

    /// Largest non-null value, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Fails for non-numeric, non-timestamp properties.
    pub fn max(&self, property: Option<&str>) -> CoreResult<Option<Value>> {
        self.aggregate(property, AggregateOp::Max)
    }

    /// Sum of the non-null values, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Fails for non-numeric properties.
    pub fn sum(&self, property: Option<&str>) -> CoreResult<Option<Value>> {
        self.aggregate(property, AggregateOp::Sum)
    }

    /// Mean of the non-null values as a double, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Fails for non-numeric properties.
    pub fn average(&self, property: Option<&str>) -> CoreResult<Option<Value>> {
        self.aggregate(property, AggregateOp::Avg)
    }

    /// Calls `callback` with the changes of each batch of commits.
    ///
    /// # Errors
    ///
    /// Fails on frozen realms, inside write transactions and when the source
    /// is gone.
    pub fn add_notification_callback(
        &self,
        key_paths: Option<KeyPathArray>,
        callback: impl FnMut(&CollectionChangeSet) + Send + 'static,
    ) -> CoreResult<NotificationToken> {
        let source = self.source.clone();
        let stages = self.stages.clone();
        self.realm.add_notifier(move |id, base| {
            let rows: RowSource =
                Box::new(move |snap: &SnapshotData| evaluate(&source, &stages, snap));
            let notifier: Arc<dyn Notifier> = Arc::new(CollectionNotifier::new(
                id,
                rows,
                key_paths,
                base,
                Box::new(callback),
            )?);
            Ok(notifier)
        })
    }
}

/// `is_column` is false when `property` describes collection elements.
fn check_aggregatable(property: &Property, is_column: bool, op: AggregateOp) -> CoreResult<()> {
    let numeric = matches!(
        property.property_type,
        PropertyType::Int | PropertyType::Float | PropertyType::Double | PropertyType::Mixed
    );
    let ok = !(is_column && property.is_collection())
        && match op {
            AggregateOp::Sum | AggregateOp::Avg => numeric,
            AggregateOp::Min | AggregateOp::Max => {
                numeric || property.property_type == PropertyType::Timestamp
            }
        };
    if ok {
        Ok(())
    } else {
        Err(CoreError::illegal(format!(
            "cannot aggregate '{}' of type {}",
            property.name,
            property.type_string()
        )))
    }
}
