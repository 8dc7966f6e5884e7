//! The query language and result sets.
//!
//! A query string is tokenized, parsed into a syntax tree, then bound
//! against the class (or element type) it runs over: names resolve to
//! property keys, `$n` arguments are substituted and comparisons are
//! type-checked. Errors at any stage carry the byte offset of the
//! offending token.
//!
//! ```text
//! age > 18 && name BEGINSWITH[c] "a" SORT(age DESC) LIMIT(10)
//! ANY dogs.name == $0
//! @links.Person.dog.@count > 1
//! ```

mod bind;
mod eval;
mod lexer;
mod parser;
mod results;

pub use results::Results;

pub(crate) use results::{Source, Stage};

use crate::collections::{List, Set};
use crate::error::CoreResult;
use crate::object::class_named;
use crate::query::bind::{Binder, Descriptor, Predicate};
use crate::realm::Realm;
use crate::value::Value;
use std::sync::Arc;

/// A parsed and bound query over a table, collection or results.
#[derive(Debug, Clone)]
pub struct Query {
    realm: Realm,
    source: Source,
    /// Stages of the results the query was built on.
    base: Vec<Stage>,
    predicate: Predicate,
    descriptors: Vec<Descriptor>,
}

impl Query {
    fn compile(realm: Realm, source: Source, base: Vec<Stage>, text: &str, args: &[Value]) -> CoreResult<Self> {
        let parsed = parser::parse(text)?;
        let (predicate, descriptors) = realm.read(|snap| {
            let domain = source.domain(snap)?;
            Binder::new(snap, &domain, args).bind(&parsed)
        })?;
        tracing::debug!(target: "realm.storage.query", query = text, "bound query");
        Ok(Self {
            realm,
            source,
            base,
            predicate,
            descriptors,
        })
    }

    /// Parses `text` against the objects of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::Parse`] with the byte offset of the
    /// problem for malformed queries, unknown properties, missing arguments
    /// and type mismatches, or [`crate::CoreError::NoSuchClass`].
    pub fn parse(realm: &Realm, class: &str, text: &str, args: &[Value]) -> CoreResult<Self> {
        let class = realm.read(|snap| class_named(snap, class))?;
        Self::compile(realm.clone(), Source::Table(class), Vec::new(), text, args)
    }

    /// Parses `text` against the elements of `list`. Lists of values are
    /// queried through `self`.
    ///
    /// # Errors
    ///
    /// See [`Query::parse`].
    pub fn parse_for_list(list: &List, text: &str, args: &[Value]) -> CoreResult<Self> {
        let source = Source::Collection(list.target().clone());
        Self::compile(list.realm().clone(), source, Vec::new(), text, args)
    }

    /// Parses `text` against the elements of `set`.
    ///
    /// # Errors
    ///
    /// See [`Query::parse`].
    pub fn parse_for_set(set: &Set, text: &str, args: &[Value]) -> CoreResult<Self> {
        let source = Source::Collection(set.target().clone());
        Self::compile(set.realm().clone(), source, Vec::new(), text, args)
    }

    /// Parses `text` against the rows of `results`, keeping their order.
    ///
    /// # Errors
    ///
    /// See [`Query::parse`].
    pub fn parse_for_results(results: &Results, text: &str, args: &[Value]) -> CoreResult<Self> {
        Self::compile(
            results.realm().clone(),
            results.source().clone(),
            results.stages().to_vec(),
            text,
            args,
        )
    }

    /// Rebuilds a query from a results pipeline. Filters after the last
    /// ordering stage fold into the predicate; earlier stages stay as base.
    pub(crate) fn from_stages(realm: Realm, source: Source, stages: &[Stage]) -> CoreResult<Self> {
        let split = stages
            .iter()
            .rposition(|stage| matches!(stage, Stage::Order(_)))
            .filter(|last_order| stages[last_order + 1..].iter().any(|s| matches!(s, Stage::Filter(_))))
            .map_or(0, |last_order| last_order + 1);
        let (base, rest) = stages.split_at(split);
        let mut predicate = Predicate::True;
        let mut descriptors = Vec::new();
        for stage in rest {
            match stage {
                Stage::Filter(filter) => predicate = predicate.and(Predicate::clone(filter)),
                Stage::Order(descriptor) => descriptors.push(Descriptor::clone(descriptor)),
            }
        }
        Ok(Self {
            realm,
            source,
            base: base.to_vec(),
            predicate,
            descriptors,
        })
    }

    /// Canonical text of the query, including descriptors.
    #[must_use]
    pub fn get_description(&self) -> String {
        let mut out = self.predicate.to_string();
        for descriptor in &self.descriptors {
            out.push(' ');
            out.push_str(&descriptor.to_string());
        }
        out
    }

    /// This query AND `text`. Descriptors in `text` apply after existing
    /// ones.
    ///
    /// # Errors
    ///
    /// See [`Query::parse`].
    pub fn append_query(&self, text: &str, args: &[Value]) -> CoreResult<Self> {
        let mut appended = Self::compile(self.realm.clone(), self.source.clone(), self.base.clone(), text, args)?;
        appended.predicate = self.predicate.clone().and(appended.predicate);
        let mut descriptors = self.descriptors.clone();
        descriptors.append(&mut appended.descriptors);
        appended.descriptors = descriptors;
        Ok(appended)
    }

    /// Lazy results of the query.
    #[must_use]
    pub fn find_all(&self) -> Results {
        let mut stages = self.base.clone();
        if !matches!(self.predicate, Predicate::True) {
            stages.push(Stage::Filter(Arc::new(self.predicate.clone())));
        }
        stages.extend(
            self.descriptors
                .iter()
                .map(|d| Stage::Order(Arc::new(d.clone()))),
        );
        Results::new(self.realm.clone(), self.source.clone(), stages)
    }

    /// Number of matches.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::Invalidated`] once the source is gone.
    pub fn count(&self) -> CoreResult<usize> {
        self.find_all().count()
    }

    /// The first match in result order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::Invalidated`] once the source is gone.
    pub fn find_first(&self) -> CoreResult<Option<Value>> {
        Ok(self.find_all().values()?.into_iter().next())
    }

    /// Deletes every matching object. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Fails outside a write and for queries over plain values.
    pub fn delete_all(&self) -> CoreResult<usize> {
        self.find_all().delete_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::realm::RealmConfig;
    use crate::schema::{ObjectSchema, Property, PropertyType, Schema};
    use crate::value::Timestamp;

    fn open(name: &str) -> Realm {
        let schema = Schema::new(vec![
            ObjectSchema::new("Person")
                .property(Property::new("_id", PropertyType::Int).primary_key())
                .property(Property::new("name", PropertyType::String))
                .property(Property::new("age", PropertyType::Int))
                .property(Property::new("score", PropertyType::Double).nullable())
                .property(Property::new("born", PropertyType::Timestamp).nullable())
                .property(Property::object("dog", "Dog"))
                .property(Property::object("pets", "Dog").list())
                .property(Property::new("nicknames", PropertyType::String).list()),
            ObjectSchema::new("Dog")
                .property(Property::new("name", PropertyType::String))
                .property(Property::new("weight", PropertyType::Double))
                .property(Property::linking_objects("owners", "Person", "dog")),
        ]);
        let realm = Realm::open(RealmConfig::in_memory(name).schema(schema, 1)).unwrap();
        realm
            .write(|r| {
                let rex = r.create_object("Dog")?;
                rex.set_values(vec![("name", "Rex".into()), ("weight", 30.5.into())])?;
                let fido = r.create_object("Dog")?;
                fido.set_values(vec![("name", "fido".into()), ("weight", 8.0.into())])?;
                let people = [
                    (1, "Ann", 30, Some(3.5)),
                    (2, "bob", 17, None),
                    (3, "Cara", 45, Some(1.0)),
                    (4, "Dan", 30, Some(2.0)),
                ];
                for (id, name, age, score) in people {
                    let p = r.create_object_with_primary_key("Person", id)?;
                    p.set_values(vec![
                        ("name", name.into()),
                        ("age", age.into()),
                        ("score", score.map_or(Value::Null, Value::Double)),
                    ])?;
                    if id != 2 {
                        p.set_value("dog", if id == 3 { fido.as_link() } else { rex.as_link() })?;
                    }
                    if id == 1 {
                        let pets = p.get_list("pets")?;
                        pets.push(rex.as_link())?;
                        pets.push(fido.as_link())?;
                        p.get_list("nicknames")?.push("annie")?;
                    }
                }
                Ok(())
            })
            .unwrap();
        realm
    }

    fn names(results: &Results) -> Vec<String> {
        (0..results.count().unwrap())
            .map(|i| {
                let obj = results.get_object(i).unwrap();
                obj.get_value("name").unwrap().as_str().unwrap().to_owned()
            })
            .collect()
    }

    fn find(realm: &Realm, class: &str, text: &str, args: &[Value]) -> Vec<String> {
        names(&Query::parse(realm, class, text, args).unwrap().find_all())
    }

    #[test]
    fn adults_by_age() {
        let realm = open("query-adults");
        let adults = Query::parse(&realm, "Person", "age > 18", &[]).unwrap();
        assert_eq!(adults.count().unwrap(), 3);
        assert_eq!(find(&realm, "Person", "age > 18 && age < 40", &[]), ["Ann", "Dan"]);
        assert_eq!(find(&realm, "Person", "NOT age >= 18 OR name == 'Cara'", &[]), ["bob", "Cara"]);
    }

    #[test]
    fn strings_and_modifiers() {
        let realm = open("query-strings");
        assert_eq!(find(&realm, "Person", "name BEGINSWITH 'b'", &[]), ["bob"]);
        assert_eq!(find(&realm, "Person", "name BEGINSWITH[c] 'B'", &[]), ["bob"]);
        assert_eq!(find(&realm, "Person", "name CONTAINS 'a'", &[]), ["Cara", "Dan"]);
        assert_eq!(find(&realm, "Person", "name LIKE '?a*'", &[]), ["Cara", "Dan"]);
        assert_eq!(find(&realm, "Person", "name ==[c] 'ANN'", &[]), ["Ann"]);
        assert_eq!(find(&realm, "Person", "name ENDSWITH 'n'", &[]), ["Ann", "Dan"]);
    }

    #[test]
    fn lists_ranges_nulls_and_arguments() {
        let realm = open("query-ranges");
        assert_eq!(find(&realm, "Person", "age IN {17, 45}", &[]), ["bob", "Cara"]);
        assert_eq!(find(&realm, "Person", "age BETWEEN {18, 30}", &[]), ["Ann", "Dan"]);
        assert_eq!(find(&realm, "Person", "score == nil", &[]), ["bob"]);
        assert_eq!(find(&realm, "Person", "score > 1.5", &[]), ["Ann", "Dan"]);
        assert_eq!(
            find(&realm, "Person", "age == $0 AND name != $1", &[Value::Int(30), "Ann".into()]),
            ["Dan"]
        );
        assert_eq!(find(&realm, "Person", "born == null", &[]).len(), 4);
        assert_eq!(find(&realm, "Person", "born < T10:0", &[]).len(), 0);
        assert!(Query::parse(&realm, "Person", "born == $0", &[Value::Timestamp(Timestamp::new(1, 0))]).is_ok());
        assert_eq!(find(&realm, "Person", "TRUEPREDICATE", &[]).len(), 4);
        assert!(find(&realm, "Person", "FALSEPREDICATE", &[]).is_empty());
    }

    #[test]
    fn link_paths_backlinks_and_counts() {
        let realm = open("query-links");
        assert_eq!(find(&realm, "Person", "dog.name == 'Rex'", &[]), ["Ann", "Dan"]);
        assert_eq!(find(&realm, "Person", "dog == nil", &[]), ["bob"]);
        assert_eq!(find(&realm, "Person", "ANY pets.weight < 10", &[]), ["Ann"]);
        assert_eq!(find(&realm, "Person", "ALL pets.weight > 5", &[]).len(), 4);
        assert_eq!(find(&realm, "Person", "NONE pets.name == 'Rex'", &[]), ["bob", "Cara", "Dan"]);
        assert_eq!(find(&realm, "Person", "pets.@count == 2", &[]), ["Ann"]);
        assert_eq!(find(&realm, "Person", "name.@size == 4", &[]), ["Cara"]);
        assert_eq!(find(&realm, "Person", "pets.@avg.weight > 19", &[]), ["Ann"]);
        assert_eq!(find(&realm, "Person", "pets.@sum.weight == 0", &[]).len(), 3);
        assert_eq!(find(&realm, "Person", "'annie' IN nicknames", &[]), ["Ann"]);
        assert_eq!(find(&realm, "Dog", "@links.Person.dog.@count == 2", &[]), ["Rex"]);
        assert_eq!(find(&realm, "Dog", "owners.age > 40", &[]), ["fido"]);
        assert_eq!(find(&realm, "Dog", "@links.@count > 2", &[]), ["Rex"]);
    }

    #[test]
    fn descriptors_sort_distinct_and_limit() {
        let realm = open("query-descriptors");
        assert_eq!(
            find(&realm, "Person", "TRUEPREDICATE SORT(age DESC, name ASC)", &[]),
            ["Cara", "Ann", "Dan", "bob"]
        );
        assert_eq!(
            find(&realm, "Person", "age > 0 SORT(age ASC) DISTINCT(age)", &[]),
            ["bob", "Ann", "Cara"]
        );
        assert_eq!(find(&realm, "Person", "TRUEPREDICATE SORT(age ASC) LIMIT(2)", &[]), ["bob", "Ann"]);
        let sorted = realm.find_all("Person").unwrap().sort(&[("dog.name", true), ("_id", false)]).unwrap();
        assert_eq!(names(&sorted), ["bob", "Dan", "Ann", "Cara"]);
        assert!(realm.find_all("Person").unwrap().sort(&[("pets.name", true)]).is_err());
    }

    #[test]
    fn errors_carry_positions() {
        let realm = open("query-errors");
        let err = Query::parse(&realm, "Person", "age > 'old'", &[]).unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 6, .. }));
        let err = Query::parse(&realm, "Person", "age > 1 && color == 2", &[]).unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 11, .. }));
        let err = Query::parse(&realm, "Person", "age == $1", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 7, .. }));
        let err = Query::parse(&realm, "Person", "age BEGINSWITH 'a'", &[]).unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }));
        assert!(matches!(
            Query::parse(&realm, "Cat", "TRUEPREDICATE", &[]),
            Err(CoreError::NoSuchClass { .. })
        ));
    }

    #[test]
    fn descriptions_and_appending() {
        let realm = open("query-description");
        let q = Query::parse(&realm, "Person", "age>18 && name BEGINSWITH[c] \"a\" SORT(age DESC)", &[]).unwrap();
        assert_eq!(q.get_description(), "age > 18 and name BEGINSWITH[c] \"a\" SORT(age DESC)");
        let narrowed = q.append_query("score > 3", &[]).unwrap();
        assert_eq!(narrowed.count().unwrap(), 1);
        let ann = realm.find_with_primary_key("Person", 1).unwrap().unwrap();
        assert_eq!(narrowed.find_first().unwrap(), Some(Value::Link(ann.as_link())));
        assert_eq!(
            narrowed.get_description(),
            "age > 18 and name BEGINSWITH[c] \"a\" and score > 3 SORT(age DESC)"
        );
        let filtered = realm.find_all("Person").unwrap().filter("age == 30", &[]).unwrap();
        assert_eq!(filtered.get_query().unwrap().get_description(), "age == 30");
    }

    #[test]
    fn queries_over_collections_of_values() {
        let realm = open("query-values");
        let ann = realm.find_with_primary_key("Person", 1).unwrap().unwrap();
        let nicknames = ann.get_list("nicknames").unwrap();
        realm.write(|_| nicknames.push("nan")).unwrap();
        let q = Query::parse_for_list(&nicknames, "self BEGINSWITH 'an'", &[]).unwrap();
        assert_eq!(q.find_all().values().unwrap(), vec![Value::from("annie")]);
        assert!(Query::parse_for_list(&nicknames, "name == 'x'", &[]).is_err());
        let pets = ann.get_list("pets").unwrap();
        let heavy = Query::parse_for_list(&pets, "weight > 10", &[]).unwrap();
        assert_eq!(names(&heavy.find_all()), ["Rex"]);
    }

    #[test]
    fn results_aggregates() {
        let realm = open("query-aggregates");
        let people = realm.find_all("Person").unwrap();
        assert_eq!(people.max(Some("age")).unwrap(), Some(Value::Int(45)));
        assert_eq!(people.min(Some("score")).unwrap(), Some(Value::Double(1.0)));
        assert_eq!(people.sum(Some("age")).unwrap(), Some(Value::Int(122)));
        assert_eq!(people.average(Some("age")).unwrap(), Some(Value::Double(30.5)));
        let none = people.filter("age > 100", &[]).unwrap();
        assert_eq!(none.sum(Some("age")).unwrap(), None);
        assert_eq!(none.average(Some("score")).unwrap(), None);
        assert!(people.sum(Some("name")).is_err());
        assert!(people.sum(None).is_err());
    }

    #[test]
    fn live_results_snapshots_and_delete_all() {
        let realm = open("query-live");
        let adults = Query::parse(&realm, "Person", "age >= 18", &[]).unwrap().find_all();
        let frozen = adults.freeze().unwrap();
        let snapshot = adults.snapshot().unwrap();
        assert_eq!(adults.count().unwrap(), 3);
        realm
            .write(|r| {
                r.create_object_with_primary_key("Person", 5)?.set_value("age", 50)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(adults.count().unwrap(), 4);
        assert_eq!(frozen.count().unwrap(), 3);
        assert_eq!(snapshot.count().unwrap(), 3);

        realm.begin_write().unwrap();
        let deleted = Query::parse(&realm, "Person", "age == 30", &[]).unwrap().delete_all().unwrap();
        assert_eq!(deleted, 2);
        realm.commit().unwrap();
        assert_eq!(snapshot.count().unwrap(), 1);
        assert_eq!(adults.count().unwrap(), 2);
        assert!(adults.delete_all().is_err());
    }
}
