//! Computing change sets between two versions.

use crate::notify::changes::{CollectionChangeSet, DictionaryChangeSet, Move};
use crate::notify::KeyPathArray;
use crate::storage::slot::Slot;
use crate::storage::snapshot::SnapshotData;
use crate::types::{ClassKey, ObjKey, ObjLink, PropertyKey};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// How many links deep a change still counts as a change of the root.
pub(crate) const MAX_LINK_DEPTH: usize = 4;

/// One element of an observed collection: a stable identity plus its value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Row {
    pub id: u64,
    pub value: Value,
}

/// Diffs two orderings of rows.
///
/// Rows present in both are matched by id. Matched rows that changed
/// relative order become moves; the longest run that kept its relative order
/// stays in place.
pub(crate) fn diff_rows(
    old: &[Row],
    new: &[Row],
    mut modified: impl FnMut(&Row, &Row) -> bool,
) -> CollectionChangeSet {
    let mut changes = CollectionChangeSet::default();
    let old_index: HashMap<u64, usize> = old.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let new_ids: HashSet<u64> = new.iter().map(|r| r.id).collect();

    for (i, row) in old.iter().enumerate() {
        if !new_ids.contains(&row.id) {
            changes.deletions.add(i);
        }
    }

    // (old index, new index) of every matched row, in new order.
    let mut matched = Vec::new();
    for (j, row) in new.iter().enumerate() {
        match old_index.get(&row.id) {
            Some(&i) => matched.push((i, j)),
            None => changes.insertions.add(j),
        }
    }

    let olds: Vec<usize> = matched.iter().map(|(i, _)| *i).collect();
    let stable: HashSet<usize> = longest_increasing(&olds).into_iter().collect();
    for (pos, &(i, j)) in matched.iter().enumerate() {
        if !stable.contains(&pos) {
            changes.deletions.add(i);
            changes.insertions.add(j);
            changes.moves.push(Move { from: i, to: j });
        }
        if modified(&old[i], &new[j]) {
            changes.modifications.add(i);
            changes.modifications_new.add(j);
        }
    }
    changes.moves.sort();
    changes.collection_was_cleared = !old.is_empty() && new.is_empty();
    changes
}

/// Positions (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
    // tails[k]: position of the smallest tail of an increasing run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (pos, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        prev[pos] = k.checked_sub(1).map(|p| tails[p]);
        if k == tails.len() {
            tails.push(pos);
        } else {
            tails[k] = pos;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        out.push(pos);
        cursor = prev[pos];
    }
    out.reverse();
    out
}

/// Diffs two dictionary states keyed by entry key.
pub(crate) fn diff_entries(
    old: &BTreeMap<String, Row>,
    new: &BTreeMap<String, Row>,
    mut modified: impl FnMut(&Row, &Row) -> bool,
) -> DictionaryChangeSet {
    let mut changes = DictionaryChangeSet::default();
    for (key, row) in old {
        match new.get(key) {
            None => changes.deletions.push(key.clone()),
            Some(now) if now.id != row.id || modified(row, now) => {
                changes.modifications.push(key.clone());
            }
            Some(_) => {}
        }
    }
    changes.insertions = new.keys().filter(|k| !old.contains_key(*k)).cloned().collect();
    changes.collection_was_cleared = !old.is_empty() && new.is_empty();
    changes
}

/// Whether a row's content changed, following links when it holds one.
pub(crate) fn row_changed(
    old: &SnapshotData,
    new: &SnapshotData,
    before: &Row,
    after: &Row,
    filter: Option<&KeyPathArray>,
) -> bool {
    if before.value != after.value {
        return true;
    }
    match after.value {
        Value::Link(link) => object_changed(old, new, link, filter),
        _ => false,
    }
}

/// Whether `link` changed between the versions, as seen through `filter`.
pub(crate) fn object_changed(
    old: &SnapshotData,
    new: &SnapshotData,
    link: ObjLink,
    filter: Option<&KeyPathArray>,
) -> bool {
    match filter {
        Some(paths) => paths
            .iter()
            .any(|path| path_changed(old, new, link.class, link.key, path)),
        None => object_changed_deep(old, new, link, MAX_LINK_DEPTH, &mut HashSet::new()),
    }
}

/// Properties of one object that changed, directly or through links.
pub(crate) fn changed_properties(
    old: &SnapshotData,
    new: &SnapshotData,
    class: ClassKey,
    key: ObjKey,
    filter: Option<&KeyPathArray>,
) -> Vec<PropertyKey> {
    let (Some(before), Some(after)) = (old.object(class, key), new.object(class, key)) else {
        return Vec::new();
    };
    let Ok(table) = new.table(class) else {
        return Vec::new();
    };
    let touched = after.modified_at > old.version.version;
    let mut out = Vec::new();
    for property in &table.schema.persisted_properties {
        let changed = match filter {
            Some(paths) => paths.iter().any(|path| {
                path.first().is_some_and(|(c, p)| *c == class && *p == property.key)
                    && path_changed(old, new, class, key, path)
            }),
            None => {
                let slot = after.get(property.key);
                (touched && before.get(property.key) != slot)
                    || slot.is_some_and(|s| {
                        let mut seen = HashSet::from([ObjLink::new(class, key)]);
                        links_changed(old, new, s, MAX_LINK_DEPTH - 1, &mut seen)
                    })
            }
        };
        if changed {
            out.push(property.key);
        }
    }
    out
}

fn path_changed(
    old: &SnapshotData,
    new: &SnapshotData,
    class: ClassKey,
    key: ObjKey,
    path: &[(ClassKey, PropertyKey)],
) -> bool {
    let Some(((path_class, property), rest)) = path.split_first() else {
        return false;
    };
    if *path_class != class {
        return false;
    }
    let before = old.object(class, key).and_then(|o| o.get(*property));
    let after = new.object(class, key).and_then(|o| o.get(*property));
    if before != after {
        return true;
    }
    if rest.is_empty() {
        return false;
    }
    let mut links = Vec::new();
    if let Some(slot) = after {
        slot.collect_links(&mut links);
    }
    links
        .into_iter()
        .any(|link| path_changed(old, new, link.class, link.key, rest))
}

fn object_changed_deep(
    old: &SnapshotData,
    new: &SnapshotData,
    link: ObjLink,
    depth: usize,
    seen: &mut HashSet<ObjLink>,
) -> bool {
    if depth == 0 || !seen.insert(link) {
        return false;
    }
    let Some(obj) = new.object(link.class, link.key) else {
        return old.object_exists(link);
    };
    if obj.modified_at > old.version.version {
        return true;
    }
    obj.values
        .values()
        .any(|slot| links_changed(old, new, slot, depth - 1, seen))
}

fn links_changed(
    old: &SnapshotData,
    new: &SnapshotData,
    slot: &Slot,
    depth: usize,
    seen: &mut HashSet<ObjLink>,
) -> bool {
    if depth == 0 {
        return false;
    }
    let mut links = Vec::new();
    slot.collect_links(&mut links);
    links
        .into_iter()
        .any(|link| object_changed_deep(old, new, link, depth, seen))
}
