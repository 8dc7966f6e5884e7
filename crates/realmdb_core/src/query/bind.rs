//! Resolves names in a parsed query against a class and type-checks
//! comparisons, substituting `$n` arguments.

use crate::error::{CoreError, CoreResult};
use crate::object::{class_named, property_named};
use crate::query::parser::{CompareOp, DescriptorAst, Operand, ParsedQuery, Pred, Quantifier};
use crate::schema::{Property, PropertyType};
use crate::storage::snapshot::SnapshotData;
use crate::types::{ClassKey, PropertyKey};
use crate::value::Value;
use base64::Engine;
use regex::{Regex, RegexBuilder};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Property(PropertyKey),
    Backlinks { origin: ClassKey, property: PropertyKey },
    AllBacklinks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggregateOp {
    Min,
    Max,
    Sum,
    Avg,
}

impl AggregateOp {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "@min" => Some(Self::Min),
            "@max" => Some(Self::Max),
            "@sum" => Some(Self::Sum),
            "@avg" => Some(Self::Avg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tail {
    Values,
    /// `@count` and `@size`: element count, or length of a string or blob.
    Count,
    Aggregate {
        op: AggregateOp,
        sub: Option<PropertyKey>,
    },
}

/// Static type of what a key path produces; `ty == None` is mixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Kind {
    pub ty: Option<PropertyType>,
    pub target: Option<String>,
}

impl Kind {
    fn of(property: &Property) -> Self {
        match property.property_type {
            PropertyType::Mixed => Self::default(),
            PropertyType::LinkingObjects => Self {
                ty: Some(PropertyType::Object),
                target: property.link_target.clone(),
            },
            ty => Self {
                ty: Some(ty),
                target: property.link_target.clone(),
            },
        }
    }

    fn scalar(ty: PropertyType) -> Self {
        Self {
            ty: Some(ty),
            target: None,
        }
    }

    fn name(&self) -> String {
        match (&self.target, self.ty) {
            (Some(target), _) => target.clone(),
            (None, Some(ty)) => ty.to_string(),
            (None, None) => "mixed".to_owned(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self.ty,
            None | Some(PropertyType::Int | PropertyType::Float | PropertyType::Double)
        )
    }
}

/// A resolved property path, evaluated from a row's value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyPath {
    pub text: String,
    pub steps: Vec<Step>,
    pub tail: Tail,
    /// Whether the steps pass through a collection or backlinks.
    pub many: bool,
    pub kind: Kind,
}

impl KeyPath {
    pub fn is_to_many(&self) -> bool {
        self.many && self.tail == Tail::Values
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Constant(Value),
    List(Vec<Value>),
    Path(KeyPath),
}

#[derive(Debug, Clone)]
pub(crate) struct Comparison {
    pub quantifier: Quantifier,
    pub lhs: Expr,
    pub op: CompareOp,
    pub case_insensitive: bool,
    pub rhs: Expr,
    /// Compiled LIKE patterns for constant right-hand sides.
    pub patterns: Vec<Regex>,
}

#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    True,
    False,
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Compare(Box<Comparison>),
}

impl Predicate {
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, other) | (other, Self::True) => other,
            (lhs, rhs) => Self::And(Box::new(lhs), Box::new(rhs)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Descriptor {
    Sort(Vec<(KeyPath, bool)>),
    Distinct(Vec<KeyPath>),
    Limit(usize),
}

/// What the rows of a query are: objects of a class, or plain values
/// described by an element property.
#[derive(Debug, Clone)]
pub(crate) enum Domain {
    Objects(ClassKey),
    Values(Property),
}

pub(crate) struct Binder<'a> {
    snap: &'a SnapshotData,
    domain: &'a Domain,
    args: &'a [Value],
}

impl<'a> Binder<'a> {
    pub fn new(snap: &'a SnapshotData, domain: &'a Domain, args: &'a [Value]) -> Self {
        Self { snap, domain, args }
    }

    pub fn bind(&self, parsed: &ParsedQuery) -> CoreResult<(Predicate, Vec<Descriptor>)> {
        let predicate = self.predicate(&parsed.predicate)?;
        let descriptors = parsed
            .descriptors
            .iter()
            .map(|d| self.descriptor(d))
            .collect::<CoreResult<_>>()?;
        Ok((predicate, descriptors))
    }

    /// Binds a sort or distinct path given as dotted text.
    pub fn ordering_path(&self, text: &str) -> CoreResult<KeyPath> {
        let segments: Vec<String> = text.split('.').map(str::to_owned).collect();
        let path = self.path(&segments, 0)?;
        if path.is_to_many() {
            return Err(CoreError::illegal(format!(
                "cannot sort or deduplicate on to-many key path '{text}'"
            )));
        }
        Ok(path)
    }

    fn descriptor(&self, descriptor: &DescriptorAst) -> CoreResult<Descriptor> {
        let bind = |segments: &[String], position: usize| -> CoreResult<KeyPath> {
            let path = self.path(segments, position)?;
            if path.is_to_many() {
                return Err(CoreError::parse(
                    format!("cannot sort or deduplicate on to-many key path '{}'", path.text),
                    position,
                ));
            }
            Ok(path)
        };
        Ok(match descriptor {
            DescriptorAst::Sort(keys) => Descriptor::Sort(
                keys.iter()
                    .map(|k| Ok((bind(&k.segments, k.position)?, k.ascending)))
                    .collect::<CoreResult<_>>()?,
            ),
            DescriptorAst::Distinct(paths) => Descriptor::Distinct(
                paths
                    .iter()
                    .map(|(segments, position)| bind(segments, *position))
                    .collect::<CoreResult<_>>()?,
            ),
            DescriptorAst::Limit(n) => Descriptor::Limit(*n),
        })
    }

    fn predicate(&self, pred: &Pred) -> CoreResult<Predicate> {
        Ok(match pred {
            Pred::True => Predicate::True,
            Pred::False => Predicate::False,
            Pred::And(a, b) => Predicate::And(Box::new(self.predicate(a)?), Box::new(self.predicate(b)?)),
            Pred::Or(a, b) => Predicate::Or(Box::new(self.predicate(a)?), Box::new(self.predicate(b)?)),
            Pred::Not(inner) => Predicate::Not(Box::new(self.predicate(inner)?)),
            Pred::Compare {
                quantifier,
                lhs,
                op,
                case_insensitive,
                rhs,
            } => Predicate::Compare(Box::new(self.comparison(
                *quantifier,
                lhs,
                *op,
                *case_insensitive,
                rhs,
            )?)),
        })
    }

    fn comparison(
        &self,
        quantifier: Quantifier,
        lhs_ast: &Operand,
        op: CompareOp,
        case_insensitive: bool,
        rhs_ast: &Operand,
    ) -> CoreResult<Comparison> {
        let lhs = self.operand(lhs_ast)?;
        let rhs = self.operand(rhs_ast)?;
        if quantifier != Quantifier::Any
            && !matches!(&lhs, Expr::Path(path) if path.is_to_many())
        {
            return Err(CoreError::parse(
                "ALL and NONE need a to-many key path on the left",
                lhs_ast.position(),
            ));
        }
        if !matches!(lhs, Expr::Path(_)) && !matches!(rhs, Expr::Path(_)) {
            return Err(CoreError::parse(
                "a comparison needs at least one key path",
                lhs_ast.position(),
            ));
        }
        check_side(&lhs, &rhs, op, rhs_ast.position())?;
        check_side(&rhs, &lhs, op, lhs_ast.position())?;
        let patterns = if op == CompareOp::Like {
            constants(&rhs)
                .filter_map(Value::as_str)
                .map(|p| like_pattern(p, case_insensitive, rhs_ast.position()))
                .collect::<CoreResult<_>>()?
        } else {
            Vec::new()
        };
        Ok(Comparison {
            quantifier,
            lhs,
            op,
            case_insensitive,
            rhs,
            patterns,
        })
    }

    fn operand(&self, operand: &Operand) -> CoreResult<Expr> {
        Ok(match operand {
            Operand::Path { segments, position } => Expr::Path(self.path(segments, *position)?),
            Operand::List { items, .. } => Expr::List(
                items
                    .iter()
                    .map(|item| match self.operand(item)? {
                        Expr::Constant(value) => Ok(value),
                        _ => Err(CoreError::parse("lists may only hold values", item.position())),
                    })
                    .collect::<CoreResult<_>>()?,
            ),
            Operand::Literal { value, .. } => Expr::Constant(value.clone()),
            Operand::Arg { index, position } => {
                let value = self.args.get(*index).ok_or_else(|| {
                    CoreError::parse(
                        format!(
                            "query refers to ${index} but {} argument(s) were given",
                            self.args.len()
                        ),
                        *position,
                    )
                })?;
                if value.is_collection() {
                    return Err(CoreError::parse(
                        format!("argument ${index} is a nested collection"),
                        *position,
                    ));
                }
                Expr::Constant(value.clone())
            }
        })
    }

    fn path(&self, segments: &[String], position: usize) -> CoreResult<KeyPath> {
        let text = segments.join(".");
        let fail = |message: String| CoreError::parse(message, position);
        let class = match (self.domain, segments) {
            (Domain::Values(element), [only]) if only == "self" => {
                return Ok(KeyPath {
                    text,
                    steps: Vec::new(),
                    tail: Tail::Values,
                    many: false,
                    kind: Kind::of(element),
                })
            }
            (Domain::Objects(class), [only]) if only == "self" => {
                return Ok(KeyPath {
                    text,
                    steps: Vec::new(),
                    tail: Tail::Values,
                    many: false,
                    kind: Kind {
                        ty: Some(PropertyType::Object),
                        target: Some(self.snap.class_name(*class)),
                    },
                })
            }
            (Domain::Values(_), _) => {
                return Err(fail(format!(
                    "'{text}' is not valid on a collection of values; use 'self'"
                )))
            }
            (Domain::Objects(class), _) => *class,
        };

        let mut class = Some(class);
        let mut steps = Vec::new();
        let mut many = false;
        let mut kind = Kind::default();
        let mut last: Option<Property> = None;
        let mut i = 0;
        while i < segments.len() {
            let name = segments[i].as_str();
            let is_last = i + 1 == segments.len();
            if name == "@count" || name == "@size" {
                if !is_last {
                    return Err(fail(format!("{name} must end the key path")));
                }
                let countable = many
                    || matches!(kind.ty, Some(PropertyType::String | PropertyType::Binary))
                    || last.as_ref().is_some_and(Property::is_collection);
                if steps.is_empty() || !countable {
                    return Err(fail(format!("{name} needs a collection, string or binary")));
                }
                return Ok(KeyPath {
                    text,
                    steps,
                    tail: Tail::Count,
                    many,
                    kind: Kind::scalar(PropertyType::Int),
                });
            }
            if let Some(op) = AggregateOp::from_name(name) {
                return self.aggregate(text, steps, many, last, &segments[i + 1..], op, position);
            }
            if name.starts_with('@') && name != "@links" {
                return Err(fail(format!("unknown operator '{name}'")));
            }

            let Some(current) = class else {
                return Err(fail(format!("'{text}' continues past a value")));
            };
            if name == "@links" {
                many = true;
                if segments.get(i + 1).map(String::as_str) == Some("@count") {
                    steps.push(Step::AllBacklinks);
                    class = None;
                    kind = Kind::scalar(PropertyType::Object);
                    i += 1;
                    continue;
                }
                let (Some(origin_name), Some(property_name)) = (segments.get(i + 1), segments.get(i + 2))
                else {
                    return Err(fail("@links needs a class and a property".to_owned()));
                };
                let origin = class_named(self.snap, origin_name).map_err(|e| fail(e.to_string()))?;
                let property =
                    property_named(self.snap, origin, property_name).map_err(|e| fail(e.to_string()))?;
                let target = self.snap.class_name(current);
                if property.link_target.as_deref() != Some(target.as_str())
                    || property.property_type != PropertyType::Object
                {
                    return Err(fail(format!(
                        "{origin_name}.{property_name} does not link to {target}"
                    )));
                }
                steps.push(Step::Backlinks {
                    origin,
                    property: property.key,
                });
                class = Some(origin);
                kind = Kind {
                    ty: Some(PropertyType::Object),
                    target: Some(origin_name.clone()),
                };
                last = None;
                i += 3;
                continue;
            }
            let property = property_named(self.snap, current, name).map_err(|e| fail(e.to_string()))?;
            if property.property_type == PropertyType::LinkingObjects {
                let origin_name = property.link_target.clone().unwrap_or_default();
                let origin = class_named(self.snap, &origin_name).map_err(|e| fail(e.to_string()))?;
                let origin_property = property_named(
                    self.snap,
                    origin,
                    property.link_origin_property.as_deref().unwrap_or_default(),
                )
                .map_err(|e| fail(e.to_string()))?;
                steps.push(Step::Backlinks {
                    origin,
                    property: origin_property.key,
                });
                many = true;
                class = Some(origin);
            } else {
                steps.push(Step::Property(property.key));
                many |= property.is_collection();
                class = match (&property.property_type, &property.link_target) {
                    (PropertyType::Object, Some(target)) => self.snap.class_key(target),
                    _ => None,
                };
            }
            kind = Kind::of(&property);
            last = Some(property);
            i += 1;
        }
        Ok(KeyPath {
            text,
            steps,
            tail: Tail::Values,
            many,
            kind,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &self,
        text: String,
        steps: Vec<Step>,
        many: bool,
        last: Option<Property>,
        rest: &[String],
        op: AggregateOp,
        position: usize,
    ) -> CoreResult<KeyPath> {
        let fail = |message: String| CoreError::parse(message, position);
        let Some(collection) = last.filter(|p| many && p.is_collection()) else {
            return Err(fail(format!("'{text}' does not aggregate over a collection")));
        };
        let links = matches!(
            collection.property_type,
            PropertyType::Object | PropertyType::LinkingObjects
        );
        let (element, sub) = match (links, rest) {
            (true, [name]) => {
                let target = collection.link_target.as_deref().unwrap_or_default();
                let class = class_named(self.snap, target).map_err(|e| fail(e.to_string()))?;
                let property = property_named(self.snap, class, name).map_err(|e| fail(e.to_string()))?;
                if property.is_collection() || !property.is_persisted() {
                    return Err(fail(format!("cannot aggregate over '{name}'")));
                }
                (Kind::of(&property), Some(property.key))
            }
            (false, []) => (Kind::of(&collection), None),
            (true, _) => return Err(fail(format!("'{text}' needs one property after the aggregate"))),
            (false, _) => return Err(fail(format!("'{text}' has nothing to aggregate after the operator"))),
        };
        let valid = match op {
            AggregateOp::Sum | AggregateOp::Avg => element.is_numeric(),
            AggregateOp::Min | AggregateOp::Max => {
                element.is_numeric() || element.ty == Some(PropertyType::Timestamp)
            }
        };
        if !valid {
            return Err(fail(format!("'{text}' aggregates a non-numeric property")));
        }
        let kind = match op {
            AggregateOp::Avg => Kind::scalar(PropertyType::Double),
            _ => element,
        };
        Ok(KeyPath {
            text,
            steps,
            tail: Tail::Aggregate { op, sub },
            many,
            kind,
        })
    }
}

fn constants(expr: &Expr) -> Box<dyn Iterator<Item = &Value> + '_> {
    match expr {
        Expr::Constant(value) => Box::new(std::iter::once(value)),
        Expr::List(values) => Box::new(values.iter()),
        Expr::Path(_) => Box::new(std::iter::empty()),
    }
}

/// Checks the constants on `other` against the key path on `side`.
fn check_side(side: &Expr, other: &Expr, op: CompareOp, position: usize) -> CoreResult<()> {
    let Expr::Path(path) = side else {
        return Ok(());
    };
    let kind = &path.kind;
    let fail = |message: String| Err(CoreError::parse(message, position));
    if op.is_string_op() {
        let ok = match op {
            CompareOp::Text => matches!(kind.ty, None | Some(PropertyType::String)),
            _ => matches!(kind.ty, None | Some(PropertyType::String | PropertyType::Binary)),
        };
        if !ok {
            return fail(format!("{} needs a string property, not '{}'", op.symbol(), path.text));
        }
    }
    if matches!(op, CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge | CompareOp::Between)
        && matches!(kind.ty, Some(PropertyType::Object | PropertyType::Bool))
    {
        return fail(format!("'{}' cannot be ordered", path.text));
    }
    if let (Expr::Path(other_path), Some(a), Some(b)) = (other, kind.ty, other.path_kind()) {
        let numeric = |t| matches!(t, PropertyType::Int | PropertyType::Float | PropertyType::Double);
        if a != b && !(numeric(a) && numeric(b)) {
            return fail(format!(
                "cannot compare '{}' ({a}) with '{}' ({b})",
                path.text, other_path.text
            ));
        }
    }
    for value in constants(other) {
        if value.is_null() {
            continue;
        }
        if op.is_string_op() {
            if !matches!(value, Value::String(_) | Value::Binary(_)) {
                return fail(format!(
                    "{} needs a string argument, got {}",
                    op.symbol(),
                    value.type_name()
                ));
            }
            continue;
        }
        let Some(ty) = kind.ty else {
            continue;
        };
        let ok = match ty {
            PropertyType::Int | PropertyType::Float | PropertyType::Double => value.is_numeric(),
            PropertyType::Object => matches!(value, Value::Link(_)),
            ty => ty.accepts(value),
        };
        if !ok {
            return fail(format!(
                "cannot compare '{}' ({}) with a {} value",
                path.text,
                kind.name(),
                value.type_name()
            ));
        }
    }
    Ok(())
}

impl Expr {
    fn path_kind(&self) -> Option<PropertyType> {
        match self {
            Self::Path(path) => path.kind.ty,
            _ => None,
        }
    }
}

fn like_pattern(pattern: &str, case_insensitive: bool, position: usize) -> CoreResult<Regex> {
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
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|err| CoreError::parse(format!("invalid LIKE pattern: {err}"), position))
}

pub(crate) fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::String(s) => {
            f.write_str("\"")?;
            for c in s.chars() {
                match c {
                    '"' => f.write_str("\\\"")?,
                    '\\' => f.write_str("\\\\")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")
        }
        Value::Timestamp(ts) => write!(f, "T{}:{}", ts.seconds, ts.nanoseconds),
        Value::Binary(bytes) => write!(
            f,
            "B64\"{}\"",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ),
        Value::ObjectId(oid) => write!(f, "oid({})", oid.to_hex()),
        Value::Link(link) => write!(f, "O{}:{}", link.class.0, link.key.0),
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => write_literal(f, value),
            Self::Path(path) => f.write_str(&path.text),
            Self::List(values) => {
                f.write_str("{")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_literal(f, value)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => f.write_str("TRUEPREDICATE"),
            Self::False => f.write_str("FALSEPREDICATE"),
            Self::And(a, b) => write!(f, "{a} and {b}"),
            Self::Or(a, b) => write!(f, "({a} or {b})"),
            Self::Not(inner) => write!(f, "!({inner})"),
            Self::Compare(c) => {
                match c.quantifier {
                    Quantifier::Any => {}
                    Quantifier::All => f.write_str("ALL ")?,
                    Quantifier::None => f.write_str("NONE ")?,
                }
                write!(f, "{} {}", c.lhs, c.op.symbol())?;
                if c.case_insensitive {
                    f.write_str("[c]")?;
                }
                write!(f, " {}", c.rhs)
            }
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sort(keys) => {
                f.write_str("SORT(")?;
                for (i, (path, ascending)) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", path.text, if *ascending { "ASC" } else { "DESC" })?;
                }
                f.write_str(")")
            }
            Self::Distinct(paths) => {
                f.write_str("DISTINCT(")?;
                for (i, path) in paths.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&path.text)?;
                }
                f.write_str(")")
            }
            Self::Limit(n) => write!(f, "LIMIT({n})"),
        }
    }
}
