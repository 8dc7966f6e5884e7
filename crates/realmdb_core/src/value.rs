//! Dynamically typed property values.

use crate::types::ObjLink;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::OnceLock;
use uuid::Uuid;

/// A point in time with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second, same sign as `seconds`.
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Creates a timestamp.
    #[must_use]
    pub const fn new(seconds: i64, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Converts from a chrono datetime.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanoseconds: dt.timestamp_subsec_nanos() as i32,
        }
    }

    /// Converts to a chrono datetime, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.nanoseconds.rem_euclid(1_000_000_000)).ok()?;
        let seconds = if self.nanoseconds < 0 {
            self.seconds - 1
        } else {
            self.seconds
        };
        Utc.timestamp_opt(seconds, nanos).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "T{}:{}", self.seconds, self.nanoseconds),
        }
    }
}

/// A 12-byte object identifier: 4 bytes of seconds, 5 random bytes and a
/// 3 byte counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    /// Generates a new identifier.
    #[must_use]
    pub fn generate() -> Self {
        static PROCESS_RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
        static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

        let random = PROCESS_RANDOM.get_or_init(rand::random::<[u8; 5]>);
        let counter = COUNTER
            .get_or_init(|| AtomicU32::new(rand::random::<u32>()))
            .fetch_add(1, AtomicOrdering::Relaxed);

        let seconds = Utc::now().timestamp() as u32;
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(random);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    /// Parses 24 hex digits.
    #[must_use]
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 24 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A property value.
///
/// `List` and `Dictionary` mark a nested collection stored in a mixed slot;
/// their contents are reached through collection accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Byte blob.
    Binary(Vec<u8>),
    /// Point in time.
    Timestamp(Timestamp),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Object identifier.
    ObjectId(ObjectId),
    /// UUID.
    Uuid(Uuid),
    /// Link to an object.
    Link(ObjLink),
    /// Marker for a nested list.
    List,
    /// Marker for a nested dictionary.
    Dictionary,
}

impl Value {
    /// Short name of the value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Timestamp(_) => "timestamp",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::ObjectId(_) => "objectId",
            Self::Uuid(_) => "uuid",
            Self::Link(_) => "link",
            Self::List => "list",
            Self::Dictionary => "dictionary",
        }
    }

    /// Whether this is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this is a nested collection marker.
    #[must_use]
    pub const fn is_collection(&self) -> bool {
        matches!(self, Self::List | Self::Dictionary)
    }

    /// Integer content.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean content.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String content.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Double content, widening ints and floats.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Link content.
    #[must_use]
    pub const fn as_link(&self) -> Option<ObjLink> {
        match self {
            Self::Link(link) => Some(*link),
            _ => None,
        }
    }

    /// Whether the value is numeric.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_) | Self::Double(_))
    }

    /// Ordering between comparable values.
    ///
    /// Numbers compare across int/float/double. Values of unrelated types
    /// yield `None`; `Null` only compares equal to `Null`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::ObjectId(a), Self::ObjectId(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Link(a), Self::Link(b)) => Some(a.cmp(b)),
            (Self::List, Self::List) | (Self::Dictionary, Self::Dictionary) => {
                Some(Ordering::Equal)
            }
            _ => None,
        }
    }

    /// Equality with numeric widening (`Int(1)` equals `Double(1.0)`).
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Total order used for sorting and set membership.
    ///
    /// Types rank as null, bool, numbers, string, binary, timestamp,
    /// object id, uuid, link, nested collections.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        let rank = self.rank().cmp(&other.rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
            }
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) | Self::Double(_) => 2,
            Self::String(_) => 3,
            Self::Binary(_) => 4,
            Self::Timestamp(_) => 5,
            Self::ObjectId(_) => 6,
            Self::Uuid(_) => 7,
            Self::Link(_) => 8,
            Self::List => 9,
            Self::Dictionary => 10,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::Binary(v) => write!(f, "<binary {} bytes>", v.len()),
            Self::Timestamp(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::ObjectId(v) => write!(f, "oid({v})"),
            Self::Uuid(v) => write!(f, "uuid({v})"),
            Self::Link(v) => write!(f, "{v}"),
            Self::List => f.write_str("[...]"),
            Self::Dictionary => f.write_str("{...}"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

value_from! {
    i64 => Int,
    bool => Bool,
    String => String,
    Vec<u8> => Binary,
    Timestamp => Timestamp,
    f32 => Float,
    f64 => Double,
    ObjectId => ObjectId,
    Uuid => Uuid,
    ObjLink => Link,
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A value usable as a primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// Null key (nullable primary key properties only).
    Null,
    /// Integer key.
    Int(i64),
    /// String key.
    String(String),
    /// Object id key.
    ObjectId(ObjectId),
    /// UUID key.
    Uuid(Uuid),
}

impl Hash for PrimaryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Int(v) => v.hash(state),
            Self::String(v) => v.hash(state),
            Self::ObjectId(v) => v.hash(state),
            Self::Uuid(v) => v.hash(state),
        }
    }
}

impl PrimaryKey {
    /// Converts a value into a key, if its type can be a primary key.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Int(v) => Some(Self::Int(*v)),
            Value::String(v) => Some(Self::String(v.clone())),
            Value::ObjectId(v) => Some(Self::ObjectId(*v)),
            Value::Uuid(v) => Some(Self::Uuid(*v)),
            _ => None,
        }
    }

    /// The key as a value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(v) => Value::Int(*v),
            Self::String(v) => Value::String(v.clone()),
            Self::ObjectId(v) => Value::ObjectId(*v),
            Self::Uuid(v) => Value::Uuid(*v),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_value(), f)
    }
}
