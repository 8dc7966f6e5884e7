//! Change sets delivered to notification callbacks.

use crate::types::PropertyKey;
use std::collections::BTreeSet;
use std::ops::Range;

/// A sorted set of indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSet(BTreeSet<usize>);

impl IndexSet {
    /// Adds an index.
    pub fn add(&mut self, index: usize) {
        self.0.insert(index);
    }

    /// Whether `index` is in the set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    /// Number of indices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Indices collected into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    /// Maximal runs of consecutive indices.
    #[must_use]
    pub fn ranges(&self) -> Vec<Range<usize>> {
        let mut out: Vec<Range<usize>> = Vec::new();
        for index in self.iter() {
            match out.last_mut() {
                Some(last) if last.end == index => last.end += 1,
                _ => out.push(index..index + 1),
            }
        }
        out
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An element that changed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Move {
    /// Index in the old collection.
    pub from: usize,
    /// Index in the new collection.
    pub to: usize,
}

/// Changes to a list, set or results between two versions.
///
/// Every move's `from` is also in `deletions` and its `to` in `insertions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChangeSet {
    /// Removed indices, relative to the old collection.
    pub deletions: IndexSet,
    /// Added indices, relative to the new collection.
    pub insertions: IndexSet,
    /// Changed elements, relative to the old collection.
    pub modifications: IndexSet,
    /// Changed elements, relative to the new collection.
    pub modifications_new: IndexSet,
    /// Elements that moved.
    pub moves: Vec<Move>,
    /// The collection went from non-empty to empty.
    pub collection_was_cleared: bool,
    /// The object owning the collection was deleted. No further
    /// notifications follow.
    pub root_was_deleted: bool,
}

impl CollectionChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.moves.is_empty()
            && !self.collection_was_cleared
            && !self.root_was_deleted
    }

    /// Deletions as ranges.
    #[must_use]
    pub fn deletion_ranges(&self) -> Vec<Range<usize>> {
        self.deletions.ranges()
    }

    /// Insertions as ranges.
    #[must_use]
    pub fn insertion_ranges(&self) -> Vec<Range<usize>> {
        self.insertions.ranges()
    }

    /// Old-index modifications as ranges.
    #[must_use]
    pub fn modification_ranges(&self) -> Vec<Range<usize>> {
        self.modifications.ranges()
    }

    /// New-index modifications as ranges.
    #[must_use]
    pub fn modification_new_ranges(&self) -> Vec<Range<usize>> {
        self.modifications_new.ranges()
    }
}

/// Changes to a dictionary between two versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictionaryChangeSet {
    /// Removed keys.
    pub deletions: Vec<String>,
    /// Added keys.
    pub insertions: Vec<String>,
    /// Keys whose value changed.
    pub modifications: Vec<String>,
    /// The dictionary went from non-empty to empty.
    pub collection_was_cleared: bool,
    /// The owning object was deleted.
    pub root_was_deleted: bool,
}

impl DictionaryChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && !self.collection_was_cleared
            && !self.root_was_deleted
    }
}

/// Changes to one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChangeSet {
    /// The object was deleted. No further notifications follow.
    pub is_deleted: bool,
    /// Properties whose value, or linked data, changed.
    pub modified_properties: Vec<PropertyKey>,
}

impl ObjectChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_deleted && self.modified_properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge_consecutive_indices() {
        let set: IndexSet = [0, 1, 2, 5, 7, 8].into_iter().collect();
        assert_eq!(set.ranges(), vec![0..3, 5..6, 7..9]);
        assert!(IndexSet::default().ranges().is_empty());
    }

    #[test]
    fn empty_change_sets() {
        assert!(CollectionChangeSet::default().is_empty());
        let cleared = CollectionChangeSet {
            collection_was_cleared: true,
            ..CollectionChangeSet::default()
        };
        assert!(!cleared.is_empty());
        assert!(ObjectChangeSet::default().is_empty());
        assert!(DictionaryChangeSet::default().is_empty());
    }
}
