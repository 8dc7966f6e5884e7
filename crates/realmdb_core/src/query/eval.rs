//! Evaluation of bound predicates and descriptors against a snapshot.

use crate::notify::diff::Row;
use crate::query::bind::{AggregateOp, Comparison, Descriptor, Expr, KeyPath, Predicate, Step, Tail};
use crate::query::parser::{CompareOp, Quantifier};
use crate::storage::slot::Slot;
use crate::storage::snapshot::SnapshotData;
use crate::value::Value;
use regex::RegexBuilder;
use std::cmp::Ordering;
use std::collections::BTreeSet;

impl Predicate {
    pub fn eval(&self, snap: &SnapshotData, row: &Value) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::And(a, b) => a.eval(snap, row) && b.eval(snap, row),
            Self::Or(a, b) => a.eval(snap, row) || b.eval(snap, row),
            Self::Not(inner) => !inner.eval(snap, row),
            Self::Compare(cmp) => cmp.eval(snap, row),
        }
    }
}

impl Comparison {
    fn eval(&self, snap: &SnapshotData, row: &Value) -> bool {
        let lhs = self.lhs.eval(snap, row);
        let rhs = self.rhs.eval(snap, row);
        let test = |l: &Value| {
            if self.op == CompareOp::Between {
                return match rhs.as_slice() {
                    [lo, hi] => {
                        matches!(l.compare(lo), Some(Ordering::Greater | Ordering::Equal))
                            && matches!(l.compare(hi), Some(Ordering::Less | Ordering::Equal))
                    }
                    _ => false,
                };
            }
            if self.op == CompareOp::Like && !self.patterns.is_empty() {
                return l
                    .as_str()
                    .is_some_and(|text| self.patterns.iter().any(|p| p.is_match(text)));
            }
            rhs.iter().any(|r| self.compare(l, r))
        };
        match self.quantifier {
            Quantifier::Any => lhs.iter().any(test),
            Quantifier::All => lhs.iter().all(test),
            Quantifier::None => !lhs.iter().any(test),
        }
    }

    fn compare(&self, l: &Value, r: &Value) -> bool {
        let ci = self.case_insensitive;
        match self.op {
            CompareOp::Eq | CompareOp::In => equal(l, r, ci),
            CompareOp::Ne => !equal(l, r, ci),
            CompareOp::Lt => ordering(l, r, ci) == Some(Ordering::Less),
            CompareOp::Le => matches!(ordering(l, r, ci), Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Gt => ordering(l, r, ci) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(ordering(l, r, ci), Some(Ordering::Greater | Ordering::Equal)),
            CompareOp::BeginsWith | CompareOp::EndsWith | CompareOp::Contains => {
                substring(self.op, l, r, ci)
            }
            CompareOp::Like => like(l, r, ci),
            CompareOp::Text => match (l, r) {
                (Value::String(text), Value::String(terms)) => text_matches(text, terms),
                _ => false,
            },
            CompareOp::Between => false,
        }
    }
}

fn lower(l: &str, r: &str) -> (String, String) {
    (l.to_lowercase(), r.to_lowercase())
}

fn equal(l: &Value, r: &Value, ci: bool) -> bool {
    match (l, r) {
        (Value::String(a), Value::String(b)) if ci => {
            let (a, b) = lower(a, b);
            a == b
        }
        _ => l.loose_eq(r),
    }
}

fn ordering(l: &Value, r: &Value, ci: bool) -> Option<Ordering> {
    if l.is_null() || r.is_null() {
        return None;
    }
    match (l, r) {
        (Value::String(a), Value::String(b)) if ci => {
            let (a, b) = lower(a, b);
            Some(a.cmp(&b))
        }
        _ => l.compare(r),
    }
}

fn substring(op: CompareOp, l: &Value, r: &Value, ci: bool) -> bool {
    match (l, r) {
        (Value::String(a), Value::String(b)) => {
            let (a, b) = if ci { lower(a, b) } else { (a.clone(), b.clone()) };
            match op {
                CompareOp::BeginsWith => a.starts_with(&b),
                CompareOp::EndsWith => a.ends_with(&b),
                _ => a.contains(&b),
            }
        }
        (Value::Binary(a), Value::Binary(b)) => match op {
            CompareOp::BeginsWith => a.starts_with(b),
            CompareOp::EndsWith => a.ends_with(b),
            _ => b.is_empty() || a.windows(b.len()).any(|w| w == b.as_slice()),
        },
        _ => false,
    }
}

/// LIKE against a pattern only known at evaluation time.
fn like(l: &Value, r: &Value, ci: bool) -> bool {
    let (Value::String(text), Value::String(pattern)) = (l, r) else {
        return false;
    };
    let mut source = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(ci)
        .dot_matches_new_line(true)
        .build()
        .is_ok_and(|re| re.is_match(text))
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Full-text match: every term must occur as a word, `-term` must not, and
/// `term*` matches words starting with `term`.
fn text_matches(text: &str, terms: &str) -> bool {
    if terms.trim().is_empty() {
        return false;
    }
    let words = words(text);
    let has = |term: &str| match term.strip_suffix('*') {
        Some(prefix) => words.iter().any(|w| w.starts_with(prefix)),
        None => words.contains(term),
    };
    for term in terms.split_whitespace().map(str::to_lowercase) {
        match term.strip_prefix('-') {
            Some(excluded) if !excluded.is_empty() => {
                if has(excluded) {
                    return false;
                }
            }
            _ => {
                if !has(&term) {
                    return false;
                }
            }
        }
    }
    true
}

impl Expr {
    pub fn eval(&self, snap: &SnapshotData, row: &Value) -> Vec<Value> {
        match self {
            Self::Constant(value) => vec![value.clone()],
            Self::List(values) => values.clone(),
            Self::Path(path) => path.values(snap, row),
        }
    }
}

fn push_slot(slot: &Slot, out: &mut Vec<Value>) {
    match slot {
        Slot::Value(value) => out.push(value.clone()),
        Slot::List(list) => out.extend(list.items.iter().map(|e| e.slot.to_value())),
        Slot::Set(set) => out.extend(set.items.iter().map(|e| e.slot.to_value())),
        Slot::Dictionary(dict) => out.extend(dict.entries.values().map(|e| e.slot.to_value())),
    }
}

fn property_value(snap: &SnapshotData, value: &Value, property: crate::types::PropertyKey) -> Value {
    value
        .as_link()
        .and_then(|link| snap.object(link.class, link.key))
        .and_then(|obj| obj.get(property))
        .map_or(Value::Null, Slot::to_value)
}

impl KeyPath {
    /// Every value the path reaches from `root`. To-one paths always yield
    /// exactly one value; a null link along the way yields null.
    pub fn values(&self, snap: &SnapshotData, root: &Value) -> Vec<Value> {
        let mut current = vec![root.clone()];
        for step in &self.steps {
            let mut next = Vec::new();
            for value in &current {
                let Some(link) = value.as_link() else {
                    continue;
                };
                match step {
                    Step::Property(key) => {
                        if let Some(slot) = snap.object(link.class, link.key).and_then(|o| o.get(*key)) {
                            push_slot(slot, &mut next);
                        }
                    }
                    Step::Backlinks { origin, property } => {
                        for (class, key, prop, _) in snap.backlinks(link) {
                            if class == *origin && prop == *property {
                                next.push(Value::Link(crate::types::ObjLink { class, key }));
                            }
                        }
                    }
                    Step::AllBacklinks => {
                        for (class, key, _, count) in snap.backlinks(link) {
                            let origin = Value::Link(crate::types::ObjLink { class, key });
                            next.extend(std::iter::repeat(origin).take(count));
                        }
                    }
                }
            }
            current = next;
        }
        match &self.tail {
            Tail::Values => {
                if !self.many && current.is_empty() {
                    current.push(Value::Null);
                }
                current
            }
            Tail::Count => {
                let count = match current.as_slice() {
                    [Value::String(s)] if !self.many => s.chars().count(),
                    [Value::Binary(b)] if !self.many => b.len(),
                    [Value::Null] if !self.many => 0,
                    values => values.len(),
                };
                vec![Value::Int(i64::try_from(count).unwrap_or(i64::MAX))]
            }
            Tail::Aggregate { op, sub } => {
                let values = current.into_iter().map(|v| match sub {
                    Some(property) => property_value(snap, &v, *property),
                    None => v,
                });
                let aggregated = aggregate(*op, values);
                vec![match (aggregated, op) {
                    (Some(value), _) => value,
                    (None, AggregateOp::Sum) => Value::Int(0),
                    (None, _) => Value::Null,
                }]
            }
        }
    }

    /// The single value used for sorting and deduplication.
    pub fn first(&self, snap: &SnapshotData, root: &Value) -> Value {
        self.values(snap, root).into_iter().next().unwrap_or(Value::Null)
    }
}

/// Min, max, sum or average of the non-null values; `None` when there are
/// none.
///
/// `@sum` and `@avg` only see numbers. Other values, which only a mixed
/// collection can hold, count as null.
pub(crate) fn aggregate(op: AggregateOp, values: impl Iterator<Item = Value>) -> Option<Value> {
    let numeric_only = matches!(op, AggregateOp::Sum | AggregateOp::Avg);
    let values: Vec<Value> = values
        .filter(|v| !v.is_null() && (!numeric_only || v.as_f64().is_some()))
        .collect();
    if values.is_empty() {
        return None;
    }
    match op {
        AggregateOp::Min | AggregateOp::Max => {
            let mut best: Option<Value> = None;
            for value in values {
                best = match best {
                    None => Some(value),
                    Some(current) => {
                        let replace = match (value.compare(&current), op) {
                            (Some(Ordering::Less), AggregateOp::Min) => true,
                            (Some(Ordering::Greater), AggregateOp::Max) => true,
                            _ => false,
                        };
                        Some(if replace { value } else { current })
                    }
                };
            }
            best
        }
        AggregateOp::Sum => {
            if values.iter().all(|v| matches!(v, Value::Int(_))) {
                let sum = values
                    .iter()
                    .filter_map(Value::as_int)
                    .fold(0i64, i64::wrapping_add);
                Some(Value::Int(sum))
            } else if values.iter().all(|v| matches!(v, Value::Float(_))) {
                let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
                Some(Value::Float(sum as f32))
            } else {
                Some(Value::Double(values.iter().filter_map(Value::as_f64).sum()))
            }
        }
        AggregateOp::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                return None;
            }
            Some(Value::Double(numbers.iter().sum::<f64>() / numbers.len() as f64))
        }
    }
}

/// Orders values with [`Value::total_cmp`] so rows can be deduplicated.
struct DistinctKey(Vec<Value>);

impl PartialEq for DistinctKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DistinctKey {}

impl PartialOrd for DistinctKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistinctKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| self.0.len().cmp(&other.0.len()))
    }
}

impl Descriptor {
    pub fn apply(&self, snap: &SnapshotData, rows: &mut Vec<Row>) {
        match self {
            Self::Sort(keys) => {
                let mut keyed: Vec<(Vec<Value>, Row)> = rows
                    .drain(..)
                    .map(|row| {
                        let key = keys.iter().map(|(path, _)| path.first(snap, &row.value)).collect();
                        (key, row)
                    })
                    .collect();
                keyed.sort_by(|(a, _), (b, _)| {
                    a.iter()
                        .zip(b)
                        .zip(keys)
                        .map(|((x, y), (_, ascending))| {
                            let order = x.total_cmp(y);
                            if *ascending {
                                order
                            } else {
                                order.reverse()
                            }
                        })
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                });
                rows.extend(keyed.into_iter().map(|(_, row)| row));
            }
            Self::Distinct(paths) => {
                let mut seen = BTreeSet::new();
                rows.retain(|row| {
                    let key = paths.iter().map(|path| path.first(snap, &row.value)).collect();
                    seen.insert(DistinctKey(key))
                });
            }
            Self::Limit(n) => rows.truncate(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_text_terms() {
        let text = "The quick brown fox";
        assert!(text_matches(text, "quick fox"));
        assert!(text_matches(text, "QUICK"));
        assert!(!text_matches(text, "quick -fox"));
        assert!(text_matches(text, "bro*"));
        assert!(!text_matches(text, "slow"));
    }

    #[test]
    fn like_wildcards() {
        let s = |v: &str| Value::from(v);
        assert!(like(&s("hello"), &s("h*o"), false));
        assert!(like(&s("hello"), &s("h?llo"), false));
        assert!(!like(&s("hello"), &s("H*"), false));
        assert!(like(&s("hello"), &s("H*"), true));
        assert!(like(&s("a.b"), &s("a.b"), false));
        assert!(!like(&s("axb"), &s("a.b"), false));
    }

    #[test]
    fn aggregates_skip_nulls() {
        let values = || vec![Value::Int(3), Value::Null, Value::Int(1), Value::Int(2)].into_iter();
        assert_eq!(aggregate(AggregateOp::Min, values()), Some(Value::Int(1)));
        assert_eq!(aggregate(AggregateOp::Max, values()), Some(Value::Int(3)));
        assert_eq!(aggregate(AggregateOp::Sum, values()), Some(Value::Int(6)));
        assert_eq!(aggregate(AggregateOp::Avg, values()), Some(Value::Double(2.0)));
        assert_eq!(aggregate(AggregateOp::Sum, std::iter::once(Value::Null)), None);
        assert_eq!(
            aggregate(AggregateOp::Sum, vec![Value::Int(1), Value::Double(0.5)].into_iter()),
            Some(Value::Double(1.5))
        );
    }

    #[test]
    fn sums_of_mixed_values_ignore_non_numbers() {
        let values = || {
            vec![Value::Int(4), Value::from("four"), Value::Bool(true), Value::Double(2.0)].into_iter()
        };
        assert_eq!(aggregate(AggregateOp::Sum, values()), Some(Value::Double(6.0)));
        assert_eq!(aggregate(AggregateOp::Avg, values()), Some(Value::Double(3.0)));
        assert_eq!(aggregate(AggregateOp::Sum, std::iter::once(Value::from("x"))), None);
        assert_eq!(
            aggregate(AggregateOp::Max, vec![Value::Int(1), Value::Int(7)].into_iter()),
            Some(Value::Int(7))
        );
    }
}
