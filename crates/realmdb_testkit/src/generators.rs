//! Property-based test generators using proptest.
//!
//! Provides strategies for values, people and list edits that keep the
//! invariants the schema in [`crate::person_schema`] requires.

use proptest::prelude::*;
use realmdb_core::{ObjectId, PropertyType, Timestamp, Value};
use std::collections::BTreeMap;

/// Strategy for non-null values of `property_type`.
///
/// Floating point values are finite so they compare equal to themselves.
///
/// # Panics
///
/// Panics for link, mixed and collection types, which have no standalone
/// value.
pub fn value_strategy(property_type: PropertyType) -> BoxedStrategy<Value> {
    match property_type {
        PropertyType::Int => any::<i64>().prop_map(Value::Int).boxed(),
        PropertyType::Bool => any::<bool>().prop_map(Value::Bool).boxed(),
        PropertyType::String => "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String).boxed(),
        PropertyType::Binary => prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(Value::Binary)
            .boxed(),
        PropertyType::Timestamp => (0i64..4_000_000_000, 0i32..1_000_000_000)
            .prop_map(|(seconds, nanoseconds)| Value::Timestamp(Timestamp { seconds, nanoseconds }))
            .boxed(),
        PropertyType::Float => (-1.0e6f32..1.0e6).prop_map(Value::Float).boxed(),
        PropertyType::Double => (-1.0e12f64..1.0e12).prop_map(Value::Double).boxed(),
        PropertyType::ObjectId => prop::array::uniform12(any::<u8>())
            .prop_map(|bytes| Value::ObjectId(ObjectId(bytes)))
            .boxed(),
        PropertyType::Uuid => prop::array::uniform16(any::<u8>())
            .prop_map(|bytes| Value::Uuid(realmdb_core::Uuid::from_bytes(bytes)))
            .boxed(),
        other => panic!("no value strategy for {other}"),
    }
}

/// Strategy for any scalar value, null included.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        3 => value_strategy(PropertyType::Int),
        1 => value_strategy(PropertyType::Bool),
        3 => value_strategy(PropertyType::String),
        1 => value_strategy(PropertyType::Double),
        1 => value_strategy(PropertyType::Timestamp),
        1 => value_strategy(PropertyType::ObjectId),
    ]
}

/// A row for the `Person` class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonRecord {
    /// Primary key.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Age.
    pub age: i64,
}

/// Strategy for up to `max` people with distinct primary keys.
pub fn people_strategy(max: usize) -> impl Strategy<Value = Vec<PersonRecord>> {
    prop::collection::btree_map(0i64..1_000, ("[A-Z][a-z]{2,8}", 0i64..100), 0..=max).prop_map(
        |people: BTreeMap<i64, (String, i64)>| {
            people
                .into_iter()
                .map(|(id, (name, age))| PersonRecord { id, name, age })
                .collect()
        },
    )
}

/// An edit to a list of integers, with indices left unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEdit {
    /// Insert at an index.
    Insert(usize, i64),
    /// Replace at an index.
    Set(usize, i64),
    /// Remove at an index.
    Erase(usize),
    /// Move from one index to another.
    Move(usize, usize),
    /// Remove everything.
    Clear,
}

impl ListEdit {
    /// Whether the edit is in bounds for a list of `len` elements.
    pub fn is_valid_for(self, len: usize) -> bool {
        match self {
            Self::Insert(i, _) => i <= len,
            Self::Set(i, _) | Self::Erase(i) => i < len,
            Self::Move(a, b) => a < len && b < len,
            Self::Clear => true,
        }
    }

    /// Applies the edit to a model vector. Out of bounds edits are ignored.
    pub fn apply_to(self, model: &mut Vec<i64>) {
        if !self.is_valid_for(model.len()) {
            return;
        }
        match self {
            Self::Insert(i, v) => model.insert(i, v),
            Self::Set(i, v) => model[i] = v,
            Self::Erase(i) => {
                model.remove(i);
            }
            Self::Move(a, b) => {
                let v = model.remove(a);
                model.insert(b, v);
            }
            Self::Clear => model.clear(),
        }
    }
}

/// Strategy for list edits over indices below `max_index`.
pub fn list_edit_strategy(max_index: usize) -> impl Strategy<Value = ListEdit> {
    prop_oneof![
        4 => (0..=max_index, -100i64..100).prop_map(|(i, v)| ListEdit::Insert(i, v)),
        2 => (0..=max_index, -100i64..100).prop_map(|(i, v)| ListEdit::Set(i, v)),
        2 => (0..=max_index).prop_map(ListEdit::Erase),
        2 => (0..=max_index, 0..=max_index).prop_map(|(a, b)| ListEdit::Move(a, b)),
        1 => Just(ListEdit::Clear),
    ]
}

/// Configuration for property tests.
pub fn proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn people_have_distinct_keys(people in people_strategy(20)) {
            let mut ids: Vec<i64> = people.iter().map(|p| p.id).collect();
            ids.dedup();
            prop_assert_eq!(ids.len(), people.len());
        }

        #[test]
        fn typed_values_match_their_type(value in value_strategy(PropertyType::Timestamp)) {
            prop_assert!(PropertyType::Timestamp.accepts(&value));
        }

        #[test]
        fn invalid_edits_leave_the_model_alone(edit in list_edit_strategy(4)) {
            let mut model = vec![1, 2];
            let before = model.clone();
            edit.apply_to(&mut model);
            if !edit.is_valid_for(2) {
                prop_assert_eq!(model, before);
            }
        }
    }
}
