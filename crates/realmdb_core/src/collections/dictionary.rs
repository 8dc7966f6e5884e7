use crate::collections::{CollectionRef, Handle, List};
use crate::error::{CoreError, CoreResult};
use crate::notify::diff::Row;
use crate::notify::notifier::{DictionaryNotifier, EntrySource, Notifier};
use crate::notify::{DictionaryChangeSet, KeyPathArray, NotificationToken};
use crate::object::{check_value, nested_slot, Object};
use crate::query::Results;
use crate::realm::Realm;
use crate::schema::{CollectionType, Property};
use crate::storage::instruction::Instruction;
use crate::storage::slot::{DictData, PathElement, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// String-keyed collection accessor. Entries iterate in key order.
#[derive(Debug, Clone)]
pub struct Dictionary {
    handle: Handle,
}

fn data(slot: &Slot) -> CoreResult<&DictData> {
    match slot {
        Slot::Dictionary(dict) => Ok(dict),
        _ => Err(CoreError::invalidated("dictionary was replaced")),
    }
}

fn check_key(key: &str) -> CoreResult<()> {
    if key.contains('.') || key.starts_with('$') {
        return Err(CoreError::illegal(format!(
            "dictionary key '{key}' must not contain '.' or start with '$'"
        )));
    }
    Ok(())
}

fn entries(slot: &Slot) -> CoreResult<BTreeMap<String, Row>> {
    Ok(data(slot)?
        .entries
        .iter()
        .map(|(key, e)| {
            (
                key.clone(),
                Row {
                    id: e.id,
                    value: e.slot.to_value(),
                },
            )
        })
        .collect())
}

impl Dictionary {
    pub(crate) fn new(realm: Realm, target: CollectionRef) -> Self {
        Self {
            handle: Handle::new(realm, target),
        }
    }

    pub(crate) fn target(&self) -> &CollectionRef {
        &self.handle.target
    }

    /// The realm this dictionary belongs to.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.handle.realm
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the dictionary is gone.
    pub fn size(&self) -> CoreResult<usize> {
        self.handle.size()
    }

    /// Whether the owning object and this dictionary still exist.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The property the dictionary belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the property was removed.
    pub fn property(&self) -> CoreResult<Property> {
        self.handle.property()
    }

    /// The entry at `index` in key order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfBounds`] past the end.
    pub fn get(&self, index: usize) -> CoreResult<(String, Value)> {
        self.handle.read(|_, slot| {
            let dict = data(slot)?;
            dict.entries
                .iter()
                .nth(index)
                .map(|(k, e)| (k.clone(), e.slot.to_value()))
                .ok_or(CoreError::IndexOutOfBounds {
                    index,
                    size: dict.entries.len(),
                })
        })
    }

    /// Keys in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the dictionary is gone.
    pub fn keys(&self) -> CoreResult<Vec<String>> {
        self.handle
            .read(|_, slot| Ok(data(slot)?.entries.keys().cloned().collect()))
    }

    /// The value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the dictionary is gone.
    pub fn find(&self, key: &str) -> CoreResult<Option<Value>> {
        self.handle
            .read(|_, slot| Ok(data(slot)?.entries.get(key).map(|e| e.slot.to_value())))
    }

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the dictionary is gone.
    pub fn contains_key(&self, key: &str) -> CoreResult<bool> {
        self.handle
            .read(|_, slot| Ok(data(slot)?.entries.contains_key(key)))
    }

    /// Index of the first entry holding `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the dictionary is gone.
    pub fn contains_value(&self, value: impl Into<Value>) -> CoreResult<Option<usize>> {
        let value = self.handle.target.element.property_type.coerce(value.into());
        self.handle.read(|_, slot| {
            Ok(data(slot)?
                .entries
                .values()
                .position(|e| matches!(&e.slot, Slot::Value(v) if *v == value)))
        })
    }

    /// The object linked under `key`.
    ///
    /// # Errors
    ///
    /// Fails when the value is not a link.
    pub fn get_linked_object(&self, key: &str) -> CoreResult<Option<Object>> {
        match self.find(key)? {
            Some(value) => self.handle.object(&value),
            None => Ok(None),
        }
    }

    /// Stores `value` under `key`, replacing any previous value. Returns
    /// the entry's index and whether the key was new.
    ///
    /// # Errors
    ///
    /// Fails outside a write, for invalid keys and for values of the wrong
    /// type.
    pub fn insert(&self, key: &str, value: impl Into<Value>) -> CoreResult<(usize, bool)> {
        check_key(key)?;
        let value = value.into();
        self.handle.write(|txn, slot| {
            let value = check_value(txn.snapshot(), &self.handle.target.element, value)?;
            self.put(txn, slot, key, Slot::Value(value))
        })
    }

    fn put(
        &self,
        txn: &mut crate::storage::store::WriteTxn,
        slot: &Slot,
        key: &str,
        value: Slot,
    ) -> CoreResult<(usize, bool)> {
        let inserted = !data(slot)?.entries.contains_key(key);
        let elem = txn.next_id();
        txn.apply(Instruction::DictInsert {
            path: self.handle.target.path.clone(),
            key: key.to_owned(),
            elem,
            slot: value,
        })?;
        let index = data(self.handle.target.resolve(txn.snapshot())?)?
            .entries
            .keys()
            .position(|k| k == key)
            .ok_or_else(|| CoreError::illegal("inserted key not found"))?;
        Ok((index, inserted))
    }

    /// Removes `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails outside a write.
    pub fn erase(&self, key: &str) -> CoreResult<bool> {
        self.handle.write(|txn, slot| {
            if !data(slot)?.entries.contains_key(key) {
                return Ok(false);
            }
            txn.apply(Instruction::DictErase {
                path: self.handle.target.path.clone(),
                key: key.to_owned(),
            })?;
            Ok(true)
        })
    }

    /// Removes every entry.
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

    /// Stores a new embedded object under `key` and returns it.
    ///
    /// # Errors
    ///
    /// Fails unless the dictionary links to an embedded class.
    pub fn insert_embedded(&self, key: &str) -> CoreResult<Object> {
        check_key(key)?;
        let link = self.handle.write(|txn, slot| {
            let link = self.handle.new_embedded(txn)?;
            self.put(txn, slot, key, Slot::Value(Value::Link(link)))?;
            Ok(link)
        })?;
        Ok(Object::new(self.handle.realm.clone(), link))
    }

    /// Stores an empty nested list or dictionary under `key`.
    ///
    /// # Errors
    ///
    /// Fails unless the dictionary holds mixed values.
    pub fn insert_collection(&self, key: &str, kind: CollectionType) -> CoreResult<(usize, bool)> {
        check_key(key)?;
        self.handle.require_mixed()?;
        self.handle.write(|txn, slot| {
            let nested = nested_slot(txn, kind)?;
            self.put(txn, slot, key, nested)
        })
    }

    /// The list nested under `key`.
    ///
    /// # Errors
    ///
    /// Fails when the entry is missing or holds no list.
    pub fn get_list(&self, key: &str) -> CoreResult<List> {
        let target = self.nested(key, |s| matches!(s, Slot::List(_)))?;
        Ok(List::new(self.handle.realm.clone(), target))
    }

    /// The dictionary nested under `key`.
    ///
    /// # Errors
    ///
    /// Fails when the entry is missing or holds no dictionary.
    pub fn get_dictionary(&self, key: &str) -> CoreResult<Self> {
        let target = self.nested(key, |s| matches!(s, Slot::Dictionary(_)))?;
        Ok(Self::new(self.handle.realm.clone(), target))
    }

    fn nested(&self, key: &str, kind: impl Fn(&Slot) -> bool) -> CoreResult<CollectionRef> {
        self.handle.read(|_, slot| {
            let element = data(slot)?
                .entries
                .get(key)
                .filter(|e| kind(&e.slot))
                .ok_or_else(|| CoreError::illegal(format!("no nested collection under '{key}'")))?;
            self.handle
                .target
                .nested(PathElement::Key(key.to_owned()), &element.slot)
        })
    }

    /// Live results over the values.
    #[must_use]
    pub fn to_results(&self) -> Results {
        self.handle.to_results()
    }

    /// This dictionary as seen through `realm`.
    ///
    /// # Errors
    ///
    /// Fails when `realm` uses another file.
    pub fn resolve_in(&self, realm: &Realm) -> CoreResult<Option<Self>> {
        Ok(self.handle.resolve_in(realm)?.map(|handle| Self { handle }))
    }

    /// Calls `callback` with the keys changed by each batch of commits.
    ///
    /// # Errors
    ///
    /// Fails on frozen realms, inside write transactions and when the
    /// dictionary is gone.
    pub fn add_notification_callback(
        &self,
        key_paths: Option<KeyPathArray>,
        callback: impl FnMut(&DictionaryChangeSet) + Send + 'static,
    ) -> CoreResult<NotificationToken> {
        let target = self.handle.target.clone();
        self.handle.realm.add_notifier(move |id, base| {
            let source: EntrySource =
                Box::new(move |snap: &SnapshotData| entries(target.resolve(snap)?));
            let notifier: Arc<dyn Notifier> = Arc::new(DictionaryNotifier::new(
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
    fn upsert_find_and_erase() {
        let (realm, holder) = holder_realm("dict-basic");
        let nums = holder.get_dictionary("nums").unwrap();
        realm.begin_write().unwrap();
        assert_eq!(nums.insert("b", 2).unwrap(), (0, true));
        assert_eq!(nums.insert("a", 1).unwrap(), (0, true));
        assert_eq!(nums.insert("b", 3).unwrap(), (1, false));
        assert_eq!(nums.get(1).unwrap(), ("b".to_owned(), Value::Int(3)));
        assert_eq!(nums.find("a").unwrap(), Some(Value::Int(1)));
        assert_eq!(nums.find("z").unwrap(), None);
        assert_eq!(nums.contains_value(3).unwrap(), Some(1));
        assert!(nums.insert("c", Value::Null).is_ok());
        assert!(nums.insert("bad.key", 1).is_err());
        assert!(nums.erase("a").unwrap());
        assert!(!nums.erase("a").unwrap());
        assert_eq!(nums.keys().unwrap(), vec!["b".to_owned(), "c".to_owned()]);
        realm.commit().unwrap();
    }

    #[test]
    fn nested_collections_in_mixed() {
        let (realm, holder) = holder_realm("dict-nested");
        realm.begin_write().unwrap();
        holder.set_collection("any", CollectionType::Dictionary).unwrap();
        let root = holder.get_dictionary("any").unwrap();
        root.insert_collection("list", CollectionType::List).unwrap();
        let list = root.get_list("list").unwrap();
        list.push("x").unwrap();
        assert_eq!(root.find("list").unwrap(), Some(Value::List));
        root.insert("list", 1).unwrap();
        assert!(!list.is_valid());
        assert!(root.get_list("list").is_err());
        assert!(holder
            .get_dictionary("nums")
            .unwrap()
            .insert_collection("x", CollectionType::List)
            .is_err());
        realm.commit().unwrap();
    }
}
