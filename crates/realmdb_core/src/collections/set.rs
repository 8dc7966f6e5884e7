use crate::collections::{collection_rows, CollectionRef, Handle};
use crate::error::{CoreError, CoreResult};
use crate::notify::notifier::{CollectionNotifier, Notifier, RowSource};
use crate::notify::{CollectionChangeSet, KeyPathArray, NotificationToken};
use crate::object::{check_value, Object};
use crate::query::Results;
use crate::realm::Realm;
use crate::schema::Property;
use crate::storage::instruction::Instruction;
use crate::storage::slot::{SetData, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::value::Value;
use std::sync::Arc;

/// Unordered collection of distinct values.
///
/// Indices follow the set's internal sort order and shift as values come
/// and go; they do not identify elements across writes.
#[derive(Debug, Clone)]
pub struct Set {
    handle: Handle,
}

fn data(slot: &Slot) -> CoreResult<&SetData> {
    match slot {
        Slot::Set(set) => Ok(set),
        _ => Err(CoreError::invalidated("set was replaced")),
    }
}

impl Set {
    pub(crate) fn new(realm: Realm, target: CollectionRef) -> Self {
        Self {
            handle: Handle::new(realm, target),
        }
    }

    pub(crate) fn target(&self) -> &CollectionRef {
        &self.handle.target
    }

    /// The realm this set belongs to.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.handle.realm
    }

    /// Number of values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the set is gone.
    pub fn size(&self) -> CoreResult<usize> {
        self.handle.size()
    }

    /// Whether the owning object and this set still exist.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The property the set belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the property was removed.
    pub fn property(&self) -> CoreResult<Property> {
        self.handle.property()
    }

    /// The value at `index` in the current order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfBounds`] past the end.
    pub fn get(&self, index: usize) -> CoreResult<Value> {
        self.handle.read(|_, slot| {
            let set = data(slot)?;
            set.items
                .get(index)
                .map(|e| e.slot.to_value())
                .ok_or(CoreError::IndexOutOfBounds {
                    index,
                    size: set.items.len(),
                })
        })
    }

    /// All values in the current order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the set is gone.
    pub fn values(&self) -> CoreResult<Vec<Value>> {
        self.handle
            .read(|_, slot| Ok(data(slot)?.items.iter().map(|e| e.slot.to_value()).collect()))
    }

    /// The object linked at `index`.
    ///
    /// # Errors
    ///
    /// Fails when the value is not a link.
    pub fn get_linked_object(&self, index: usize) -> CoreResult<Option<Object>> {
        let value = self.get(index)?;
        self.handle.object(&value)
    }

    /// Current index of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the set is gone.
    pub fn find(&self, value: impl Into<Value>) -> CoreResult<Option<usize>> {
        let value = self.handle.target.element.property_type.coerce(value.into());
        self.handle.read(|_, slot| Ok(data(slot)?.search(&value).ok()))
    }

    /// Adds `value` unless present. Returns its index and whether it was
    /// added.
    ///
    /// # Errors
    ///
    /// Fails outside a write and for values of the wrong type.
    pub fn insert(&self, value: impl Into<Value>) -> CoreResult<(usize, bool)> {
        let value = value.into();
        self.handle.write(|txn, slot| {
            let value = check_value(txn.snapshot(), &self.handle.target.element, value)?;
            if let Ok(index) = data(slot)?.search(&value) {
                return Ok((index, false));
            }
            let elem = txn.next_id();
            txn.apply(Instruction::SetInsert {
                path: self.handle.target.path.clone(),
                elem,
                value: value.clone(),
            })?;
            let index = data(self.handle.target.resolve(txn.snapshot())?)?
                .search(&value)
                .map_err(|_| CoreError::illegal("inserted value not found"))?;
            Ok((index, true))
        })
    }

    /// Removes `value`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails outside a write.
    pub fn erase(&self, value: impl Into<Value>) -> CoreResult<bool> {
        let value = self.handle.target.element.property_type.coerce(value.into());
        self.handle.write(|txn, slot| {
            if data(slot)?.search(&value).is_err() {
                return Ok(false);
            }
            txn.apply(Instruction::SetErase {
                path: self.handle.target.path.clone(),
                value,
            })?;
            Ok(true)
        })
    }

    /// Removes every value.
    ///
    /// # Errors
    ///
    /// Fails outside a write.
    pub fn clear(&self) -> CoreResult<()> {
        self.handle.write(|txn, _| {
            txn.apply(Instruction::CollectionClear {
                path: self.handle.target.path.clone(),
            })
        })
    }

    /// Deletes every linked object.
    ///
    /// # Errors
    ///
    /// Fails outside a write and for sets of values.
    pub fn remove_all(&self) -> CoreResult<()> {
        self.handle.write(|txn, slot| {
            for link in self.handle.linked(slot)? {
                txn.apply(Instruction::EraseObject {
                    class: link.class,
                    key: link.key,
                })?;
            }
            txn.apply(Instruction::CollectionClear {
                path: self.handle.target.path.clone(),
            })
        })
    }

    /// The elements as live [`Results`].
    #[must_use]
    pub fn to_results(&self) -> Results {
        self.handle.to_results()
    }

    /// This set as seen through `realm`.
    ///
    /// # Errors
    ///
    /// Fails when `realm` uses another file.
    pub fn resolve_in(&self, realm: &Realm) -> CoreResult<Option<Self>> {
        Ok(self.handle.resolve_in(realm)?.map(|handle| Self { handle }))
    }

    /// Calls `callback` with the changes of each batch of commits.
    ///
    /// # Errors
    ///
    /// Fails on frozen realms, inside write transactions and when the set
    /// is gone.
    pub fn add_notification_callback(
        &self,
        key_paths: Option<KeyPathArray>,
        callback: impl FnMut(&CollectionChangeSet) + Send + 'static,
    ) -> CoreResult<NotificationToken> {
        let target = self.handle.target.clone();
        self.handle.realm.add_notifier(move |id, base| {
            let source: RowSource =
                Box::new(move |snap: &SnapshotData| Ok(collection_rows(target.resolve(snap)?)));
            let notifier: Arc<dyn Notifier> = Arc::new(CollectionNotifier::new(
                id,
                source,
                key_paths,
                base,
                Box::new(callback),
            )?);
            Ok(notifier)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::test_support::holder_realm;

    #[test]
    fn insert_is_idempotent() {
        let (realm, holder) = holder_realm("set-idempotent");
        let tags = holder.get_set("tags").unwrap();
        realm.begin_write().unwrap();
        assert_eq!(tags.insert("x").unwrap(), (0, true));
        assert_eq!(tags.insert("x").unwrap(), (0, false));
        assert_eq!(tags.size().unwrap(), 1);
        realm.commit().unwrap();
    }

    #[test]
    fn values_stay_sorted_and_erase_reports_presence() {
        let (realm, holder) = holder_realm("set-sorted");
        let tags = holder.get_set("tags").unwrap();
        realm.begin_write().unwrap();
        for tag in ["pear", "apple", "fig"] {
            tags.insert(tag).unwrap();
        }
        assert_eq!(tags.get(0).unwrap(), Value::from("apple"));
        assert_eq!(tags.find("pear").unwrap(), Some(2));
        assert!(tags.erase("apple").unwrap());
        assert!(!tags.erase("apple").unwrap());
        assert_eq!(tags.find("pear").unwrap(), Some(1));
        assert!(tags.insert(Value::Null).is_err());
        tags.clear().unwrap();
        assert_eq!(tags.size().unwrap(), 0);
        realm.commit().unwrap();
    }
}
