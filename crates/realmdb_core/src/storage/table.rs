//! Per-class object storage.

use crate::schema::ObjectSchema;
use crate::storage::slot::ObjectData;
use crate::types::{ObjKey, PropertyKey};
use crate::value::PrimaryKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Objects of one class. Objects are shared between versions and cloned
/// on first write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableData {
    pub schema: ObjectSchema,
    pub objects: BTreeMap<ObjKey, Arc<ObjectData>>,
    pub next_key: i64,
    #[serde(skip)]
    pub pk_index: HashMap<PrimaryKey, ObjKey>,
}

impl TableData {
    pub fn new(schema: ObjectSchema) -> Self {
        Self {
            schema,
            objects: BTreeMap::new(),
            next_key: 0,
            pk_index: HashMap::new(),
        }
    }

    pub fn pk_property(&self) -> Option<PropertyKey> {
        self.schema.primary_key_property().map(|p| p.key)
    }

    pub fn find_by_pk(&self, pk: &PrimaryKey) -> Option<ObjKey> {
        self.pk_index.get(pk).copied()
    }

    pub fn rebuild_pk_index(&mut self) {
        self.pk_index.clear();
        let Some(pk_prop) = self.pk_property() else {
            return;
        };
        for (key, obj) in &self.objects {
            if let Some(pk) = obj.primary_key(Some(pk_prop)) {
                self.pk_index.insert(pk, *key);
            }
        }
    }

    pub fn get(&self, key: ObjKey) -> Option<&ObjectData> {
        self.objects.get(&key).map(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, key: ObjKey) -> Option<&mut ObjectData> {
        self.objects.get_mut(&key).map(Arc::make_mut)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}
