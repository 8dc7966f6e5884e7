//! Values as they travel over the wire.
//!
//! Objects are addressed by class name and primary key rather than by any
//! file-local key, so the same operation means the same thing on every
//! replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property values of one object, by property name.
pub type Fields = BTreeMap<String, Payload>;

/// A primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrimaryKeyValue {
    /// Null key.
    Null,
    /// Integer key.
    Int(i64),
    /// String key.
    String(String),
    /// Object id key.
    ObjectId([u8; 12]),
    /// UUID key.
    Uuid([u8; 16]),
}

impl fmt::Display for PrimaryKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::ObjectId(bytes) => {
                f.write_str("oid(")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                f.write_str(")")
            }
            Self::Uuid(bytes) => {
                f.write_str("uuid(")?;
                for (i, b) in bytes.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Absent value.
    Null,
    /// Integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// String.
    String(String),
    /// Bytes.
    Binary(Vec<u8>),
    /// Seconds and nanoseconds since the Unix epoch.
    Timestamp {
        /// Whole seconds.
        seconds: i64,
        /// Nanosecond part, same sign as `seconds`.
        nanos: i32,
    },
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Object id.
    ObjectId([u8; 12]),
    /// UUID.
    Uuid([u8; 16]),
    /// Link to a top-level object.
    Link {
        /// Target class.
        class: String,
        /// Target primary key.
        key: PrimaryKeyValue,
    },
    /// An embedded object, inlined.
    Embedded(Fields),
    /// List contents.
    List(Vec<Payload>),
    /// Set contents.
    Set(Vec<Payload>),
    /// Dictionary contents in key order.
    Dictionary(Vec<(String, Payload)>),
}

impl Payload {
    /// Whether this is [`Payload::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Links held directly or inside collections and embedded objects.
    #[must_use]
    pub fn links(&self) -> Vec<(&str, &PrimaryKeyValue)> {
        let mut out = Vec::new();
        self.collect_links(&mut out);
        out
    }

    fn collect_links<'a>(&'a self, out: &mut Vec<(&'a str, &'a PrimaryKeyValue)>) {
        match self {
            Self::Link { class, key } => out.push((class, key)),
            Self::Embedded(fields) => fields.values().for_each(|v| v.collect_links(out)),
            Self::List(items) | Self::Set(items) => items.iter().for_each(|v| v.collect_links(out)),
            Self::Dictionary(entries) => entries.iter().for_each(|(_, v)| v.collect_links(out)),
            _ => {}
        }
    }
}

impl From<PrimaryKeyValue> for Payload {
    fn from(key: PrimaryKeyValue) -> Self {
        match key {
            PrimaryKeyValue::Null => Self::Null,
            PrimaryKeyValue::Int(v) => Self::Int(v),
            PrimaryKeyValue::String(v) => Self::String(v),
            PrimaryKeyValue::ObjectId(v) => Self::ObjectId(v),
            PrimaryKeyValue::Uuid(v) => Self::Uuid(v),
        }
    }
}

impl TryFrom<Payload> for PrimaryKeyValue {
    type Error = Payload;

    fn try_from(payload: Payload) -> Result<Self, Payload> {
        match payload {
            Payload::Null => Ok(Self::Null),
            Payload::Int(v) => Ok(Self::Int(v)),
            Payload::String(v) => Ok(Self::String(v)),
            Payload::ObjectId(v) => Ok(Self::ObjectId(v)),
            Payload::Uuid(v) => Ok(Self::Uuid(v)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keys() {
        assert_eq!(PrimaryKeyValue::Int(-4).to_string(), "-4");
        assert_eq!(PrimaryKeyValue::String("a".into()).to_string(), "\"a\"");
        assert_eq!(
            PrimaryKeyValue::Uuid([0xab; 16]).to_string(),
            "uuid(abababab-abab-abab-abab-abababababab)"
        );
        assert_eq!(
            PrimaryKeyValue::ObjectId([1; 12]).to_string(),
            "oid(010101010101010101010101)"
        );
    }

    #[test]
    fn links_are_found_at_any_depth() {
        let mut inner = Fields::new();
        inner.insert(
            "owner".into(),
            Payload::Link {
                class: "Person".into(),
                key: PrimaryKeyValue::Int(1),
            },
        );
        let value = Payload::List(vec![
            Payload::Embedded(inner),
            Payload::Dictionary(vec![(
                "best".into(),
                Payload::Link {
                    class: "Dog".into(),
                    key: PrimaryKeyValue::String("rex".into()),
                },
            )]),
            Payload::Int(3),
        ]);
        let links = value.links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].0, "Person");
        assert_eq!(links[1].1, &PrimaryKeyValue::String("rex".into()));
    }

    #[test]
    fn key_conversion() {
        let key = PrimaryKeyValue::String("x".into());
        let payload = Payload::from(key.clone());
        assert_eq!(PrimaryKeyValue::try_from(payload), Ok(key));
        assert!(PrimaryKeyValue::try_from(Payload::Double(1.0)).is_err());
    }
}
