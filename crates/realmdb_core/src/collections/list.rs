use crate::collections::{collection_rows, CollectionRef, Dictionary, Handle};
use crate::error::{CoreError, CoreResult};
use crate::notify::notifier::{CollectionNotifier, Notifier, RowSource};
use crate::notify::{CollectionChangeSet, KeyPathArray, NotificationToken};
use crate::object::{check_value, nested_slot, Object};
use crate::query::Results;
use crate::realm::Realm;
use crate::schema::{CollectionType, Property};
use crate::storage::instruction::Instruction;
use crate::storage::slot::{Element, PathElement, Slot};
use crate::storage::snapshot::SnapshotData;
use crate::value::Value;
use std::sync::Arc;

/// Ordered collection accessor.
#[derive(Debug, Clone)]
pub struct List {
    handle: Handle,
}

fn items(slot: &Slot) -> CoreResult<&[Element]> {
    match slot {
        Slot::List(list) => Ok(&list.items),
        _ => Err(CoreError::invalidated("list was replaced")),
    }
}

fn element(slot: &Slot, index: usize) -> CoreResult<&Element> {
    let items = items(slot)?;
    items.get(index).ok_or(CoreError::IndexOutOfBounds {
        index,
        size: items.len(),
    })
}

impl List {
    pub(crate) fn new(realm: Realm, target: CollectionRef) -> Self {
        Self {
            handle: Handle::new(realm, target),
        }
    }

    pub(crate) fn target(&self) -> &CollectionRef {
        &self.handle.target
    }

    /// The realm this list belongs to.
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.handle.realm
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the list is gone.
    pub fn size(&self) -> CoreResult<usize> {
        self.handle.size()
    }

    /// Whether the list can still be accessed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The property the list belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the property was removed.
    pub fn property(&self) -> CoreResult<Property> {
        self.handle.property()
    }

    /// The element at `index`. Nested collections read as markers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfBounds`] past the end.
    pub fn get(&self, index: usize) -> CoreResult<Value> {
        self.handle.read(|_, slot| Ok(element(slot, index)?.slot.to_value()))
    }

    /// All elements in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the list is gone.
    pub fn values(&self) -> CoreResult<Vec<Value>> {
        self.handle
            .read(|_, slot| Ok(items(slot)?.iter().map(|e| e.slot.to_value()).collect()))
    }

    /// The object linked at `index`, `None` for a null link.
    ///
    /// # Errors
    ///
    /// Fails when the element is not a link.
    pub fn get_linked_object(&self, index: usize) -> CoreResult<Option<Object>> {
        let value = self.get(index)?;
        self.handle.object(&value)
    }

    /// Index of the first element equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Invalidated`] once the list is gone.
    pub fn find(&self, value: impl Into<Value>) -> CoreResult<Option<usize>> {
        let value = self.handle.target.element.property_type.coerce(value.into());
        self.handle.read(|_, slot| {
            Ok(items(slot)?
                .iter()
                .position(|e| matches!(&e.slot, Slot::Value(v) if *v == value)))
        })
    }

    /// Inserts `value` before `index`; `index == size` appends.
    ///
    /// # Errors
    ///
    /// Fails outside a write, past the end, and for values of the wrong type.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.handle.write(|txn, slot| {
            let size = items(slot)?.len();
            if index > size {
                return Err(CoreError::IndexOutOfBounds { index, size });
            }
            let value = check_value(txn.snapshot(), &self.handle.target.element, value)?;
            let elem = txn.next_id();
            txn.apply(Instruction::ListInsert {
                path: self.handle.target.path.clone(),
                index,
                elem,
                slot: Slot::Value(value),
            })
        })
    }

    /// Appends `value`.
    ///
    /// # Errors
    ///
    /// See [`Self::insert`].
    pub fn push(&self, value: impl Into<Value>) -> CoreResult<()> {
        let size = self.size()?;
        self.insert(size, value)
    }

    /// Replaces the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails outside a write, past the end, and for values of the wrong type.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        self.handle.write(|txn, slot| {
            element(slot, index)?;
            let value = check_value(txn.snapshot(), &self.handle.target.element, value)?;
            txn.apply(Instruction::ListSet {
                path: self.handle.target.path.clone(),
                index,
                slot: Slot::Value(value),
            })
        })
    }

    /// Removes the element at `index`. Removing a link to an embedded
    /// object deletes the object.
    ///
    /// # Errors
    ///
    /// Fails outside a write and past the end.
    pub fn erase(&self, index: usize) -> CoreResult<()> {
        self.handle.write(|txn, slot| {
            element(slot, index)?;
            txn.apply(Instruction::ListErase {
                path: self.handle.target.path.clone(),
                index,
            })
        })
    }

    /// Moves the element at `from` to `to`, shifting the ones between.
    ///
    /// # Errors
    ///
    /// Fails outside a write and when either index is past the end.
    pub fn move_element(&self, from: usize, to: usize) -> CoreResult<()> {
        self.handle.write(|txn, slot| {
            let size = items(slot)?.len();
            for index in [from, to] {
                if index >= size {
                    return Err(CoreError::IndexOutOfBounds { index, size });
                }
            }
            if from == to {
                return Ok(());
            }
            txn.apply(Instruction::ListMove {
                path: self.handle.target.path.clone(),
                from,
                to,
            })
        })
    }

    /// Removes every element.
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

    /// Deletes every linked object, which also empties the list.
    ///
    /// # Errors
    ///
    /// Fails outside a write and for lists of values.
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

    /// Inserts a new embedded object before `index` and returns it.
    ///
    /// # Errors
    ///
    /// Fails unless the list links to an embedded class.
    pub fn insert_embedded(&self, index: usize) -> CoreResult<Object> {
        let link = self.handle.write(|txn, slot| {
            let size = items(slot)?.len();
            if index > size {
                return Err(CoreError::IndexOutOfBounds { index, size });
            }
            let link = self.handle.new_embedded(txn)?;
            let elem = txn.next_id();
            txn.apply(Instruction::ListInsert {
                path: self.handle.target.path.clone(),
                index,
                elem,
                slot: Slot::Value(Value::Link(link)),
            })?;
            Ok(link)
        })?;
        Ok(Object::new(self.handle.realm.clone(), link))
    }

    /// Replaces the element at `index` with a new embedded object.
    ///
    /// # Errors
    ///
    /// Fails unless the list links to an embedded class.
    pub fn set_embedded(&self, index: usize) -> CoreResult<Object> {
        let link = self.handle.write(|txn, slot| {
            element(slot, index)?;
            let link = self.handle.new_embedded(txn)?;
            txn.apply(Instruction::ListSet {
                path: self.handle.target.path.clone(),
                index,
                slot: Slot::Value(Value::Link(link)),
            })?;
            Ok(link)
        })?;
        Ok(Object::new(self.handle.realm.clone(), link))
    }

    /// Inserts an empty nested list or dictionary before `index`.
    ///
    /// # Errors
    ///
    /// Fails unless the list holds mixed values.
    pub fn insert_collection(&self, index: usize, kind: CollectionType) -> CoreResult<()> {
        self.handle.require_mixed()?;
        self.handle.write(|txn, slot| {
            let size = items(slot)?.len();
            if index > size {
                return Err(CoreError::IndexOutOfBounds { index, size });
            }
            let nested = nested_slot(txn, kind)?;
            let elem = txn.next_id();
            txn.apply(Instruction::ListInsert {
                path: self.handle.target.path.clone(),
                index,
                elem,
                slot: nested,
            })
        })
    }

    /// Replaces the element at `index` with an empty nested collection.
    ///
    /// # Errors
    ///
    /// Fails unless the list holds mixed values.
    pub fn set_collection(&self, index: usize, kind: CollectionType) -> CoreResult<()> {
        self.handle.require_mixed()?;
        self.handle.write(|txn, slot| {
            element(slot, index)?;
            let nested = nested_slot(txn, kind)?;
            txn.apply(Instruction::ListSet {
                path: self.handle.target.path.clone(),
                index,
                slot: nested,
            })
        })
    }

    /// The list nested at `index`.
    ///
    /// # Errors
    ///
    /// Fails when the element holds no list.
    pub fn get_list(&self, index: usize) -> CoreResult<Self> {
        let target = self.handle.read(|_, slot| {
            let element = element(slot, index)?;
            if !matches!(element.slot, Slot::List(_)) {
                return Err(CoreError::illegal(format!("element {index} is not a list")));
            }
            self.handle
                .target
                .nested(PathElement::Elem(element.id), &element.slot)
        })?;
        Ok(Self::new(self.handle.realm.clone(), target))
    }

    /// The dictionary nested at `index`.
    ///
    /// # Errors
    ///
    /// Fails when the element holds no dictionary.
    pub fn get_dictionary(&self, index: usize) -> CoreResult<Dictionary> {
        let target = self.handle.read(|_, slot| {
            let element = element(slot, index)?;
            if !matches!(element.slot, Slot::Dictionary(_)) {
                return Err(CoreError::illegal(format!("element {index} is not a dictionary")));
            }
            self.handle
                .target
                .nested(PathElement::Elem(element.id), &element.slot)
        })?;
        Ok(Dictionary::new(self.handle.realm.clone(), target))
    }

    /// Live results over the elements.
    #[must_use]
    pub fn to_results(&self) -> Results {
        self.handle.to_results()
    }

    /// This list as seen through `realm`, `None` when it no longer exists
    /// there.
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
    /// Fails on frozen realms, inside write transactions and when the list
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
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn ints(list: &List) -> Vec<i64> {
        list.values()
            .unwrap()
            .into_iter()
            .filter_map(|v| v.as_int())
            .collect()
    }

    #[test]
    fn insert_set_erase_and_move() {
        let (realm, holder) = holder_realm("list-basic");
        let list = holder.get_list("ints").unwrap();
        realm.begin_write().unwrap();
        for v in [10, 20, 30] {
            list.push(v).unwrap();
        }
        list.move_element(0, 2).unwrap();
        assert_eq!(ints(&list), vec![20, 30, 10]);
        list.set(1, 31).unwrap();
        list.erase(0).unwrap();
        assert_eq!(ints(&list), vec![31, 10]);
        assert_eq!(list.find(10).unwrap(), Some(1));
        assert!(matches!(
            list.insert(5, 1),
            Err(CoreError::IndexOutOfBounds { index: 5, size: 2 })
        ));
        assert!(matches!(list.get(2), Err(CoreError::IndexOutOfBounds { .. })));
        assert!(list.push("text").is_err());
        realm.commit().unwrap();
        assert_eq!(list.size().unwrap(), 2);
    }

    #[test]
    fn writes_need_a_transaction() {
        let (_realm, holder) = holder_realm("list-no-write");
        let list = holder.get_list("ints").unwrap();
        assert!(matches!(list.push(1), Err(CoreError::NotInWriteTransaction)));
    }

    #[test]
    fn replaced_nested_list_invalidates_handle() {
        let (realm, holder) = holder_realm("list-nested");
        realm.begin_write().unwrap();
        holder.set_collection("any", CollectionType::List).unwrap();
        let nested = holder.get_list("any").unwrap();
        nested.insert_collection(0, CollectionType::Dictionary).unwrap();
        let inner = nested.get_dictionary(0).unwrap();
        inner.insert("a", 1).unwrap();
        assert_eq!(nested.get(0).unwrap(), Value::Dictionary);

        holder.set_value("any", 5).unwrap();
        assert!(!nested.is_valid());
        assert!(matches!(nested.size(), Err(CoreError::Invalidated { .. })));
        assert!(matches!(inner.size(), Err(CoreError::Invalidated { .. })));

        holder.set_collection("any", CollectionType::List).unwrap();
        assert!(!nested.is_valid());
        realm.commit().unwrap();
    }

    #[test]
    fn embedded_elements_and_remove_all() {
        let (realm, holder) = holder_realm("list-embedded");
        realm.begin_write().unwrap();
        let parts = holder.get_list("parts").unwrap();
        let first = parts.insert_embedded(0).unwrap();
        first.set_value("label", "a").unwrap();
        let replaced = parts.set_embedded(0).unwrap();
        assert!(!first.is_valid());
        assert_eq!(replaced.parent().unwrap(), Some(holder.clone()));
        assert!(parts.push(replaced.as_link()).is_err());

        let items = holder.get_list("items").unwrap();
        for n in 0..3 {
            let item = realm.create_object("Item").unwrap();
            item.set_value("n", n).unwrap();
            items.push(item.as_link()).unwrap();
        }
        assert_eq!(items.get_linked_object(2).unwrap().unwrap().get_value("n").unwrap(), Value::Int(2));
        items.remove_all().unwrap();
        assert_eq!(items.size().unwrap(), 0);
        assert_eq!(realm.find_all("Item").unwrap().count().unwrap(), 0);
        assert!(holder.get_list("ints").unwrap().remove_all().is_err());
        realm.commit().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize, i64),
        Set(usize, i64),
        Erase(usize),
        Move(usize, usize),
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..8usize, any::<i64>()).prop_map(|(i, v)| Op::Insert(i, v)),
            2 => (0..8usize, any::<i64>()).prop_map(|(i, v)| Op::Set(i, v)),
            2 => (0..8usize).prop_map(Op::Erase),
            2 => (0..8usize, 0..8usize).prop_map(|(a, b)| Op::Move(a, b)),
            1 => Just(Op::Clear),
        ]
    }

    static CASE: AtomicU64 = AtomicU64::new(0);

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn behaves_like_a_vec(ops in proptest::collection::vec(op(), 0..40)) {
            let name = format!("list-model-{}", CASE.fetch_add(1, Ordering::Relaxed));
            let (realm, holder) = holder_realm(&name);
            let list = holder.get_list("ints").unwrap();
            let mut model: Vec<i64> = Vec::new();
            realm.begin_write().unwrap();
            for op in ops {
                let len = model.len();
                let ok = match op {
                    Op::Insert(i, v) => list.insert(i, v).is_ok().then(|| model.insert(i, v)).is_some(),
                    Op::Set(i, v) => list.set(i, v).is_ok().then(|| model[i] = v).is_some(),
                    Op::Erase(i) => list.erase(i).is_ok().then(|| model.remove(i)).is_some(),
                    Op::Move(a, b) => list.move_element(a, b).is_ok().then(|| {
                        let v = model.remove(a);
                        model.insert(b, v);
                    }).is_some(),
                    Op::Clear => list.clear().is_ok().then(|| model.clear()).is_some(),
                };
                let expected = match op {
                    Op::Insert(i, _) => i <= len,
                    Op::Set(i, _) | Op::Erase(i) => i < len,
                    Op::Move(a, b) => a < len && b < len,
                    Op::Clear => true,
                };
                prop_assert_eq!(ok, expected);
            }
            realm.commit().unwrap();
            prop_assert_eq!(ints(&list), model);
        }
    }
}
