use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use url::Url;

/// Structured runtime value stored through the storage façade.
///
/// Covers everything JSON can express plus the richer types the codec
/// round-trips: dates, URLs, big integers, errors, binary blobs, sets and
/// maps with non-string keys, and an explicit `Undefined` marker.
///
/// Encoded to driver-level strings by [`codec::stringify`](crate::codec::stringify).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value. Writing it through the façade removes the key.
    Undefined,
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit IEEE 754 float. Must be finite to be encoded.
    Float(f64),
    /// Integer wider than 64 bits.
    BigInt(i128),
    /// UTF-8 string.
    String(String),
    /// Point in time, normalized to UTC.
    Date(DateTime<Utc>),
    /// Parsed URL.
    Url(Url),
    /// Captured error with its name and message.
    Error {
        /// Error class name (e.g. `"TypeError"`).
        name: String,
        /// Human-readable message.
        message: String,
    },
    /// Binary data.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Insertion-ordered set of distinct values.
    Set(Vec<Value>),
    /// Insertion-ordered map with arbitrary keys.
    Map(Vec<(Value, Value)>),
    /// String-keyed object. `BTreeMap` keeps encoding deterministic.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Returns `true` for [`Value::Undefined`].
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Borrow the string payload, if this is a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if this is a [`Value::Int`].
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean payload, if this is a [`Value::Bool`].
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the fields, if this is a [`Value::Object`].
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Url(_) => "url",
            Self::Error { .. } => "error",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
        }
    }

    /// Builds an object from `(key, value)` pairs.
    pub fn object<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i128> for Value {
    fn from(value: i128) -> Self {
        Self::BigInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Url> for Value {
    fn from(value: Url) -> Self {
        Self::Url(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Object(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::BigInt(i128::from(u))
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_becomes_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }

    #[test]
    fn object_builder_collects_fields() {
        let value = Value::object([("name", Value::from("ada")), ("age", Value::from(36))]);
        let fields = value.as_object().unwrap();
        assert_eq!(fields.get("name").and_then(Value::as_str), Some("ada"));
        assert_eq!(fields.get("age").and_then(Value::as_i64), Some(36));
    }

    #[test]
    fn json_numbers_map_to_narrowest_variant() {
        let json = serde_json::json!([1, u64::MAX, 1.5]);
        assert_eq!(
            Value::from(json),
            Value::Array(vec![
                Value::Int(1),
                Value::BigInt(i128::from(u64::MAX)),
                Value::Float(1.5),
            ])
        );
    }

    #[test]
    fn type_names_are_stable() {
        assert_eq!(Value::Undefined.type_name(), "undefined");
        assert_eq!(Value::Set(Vec::new()).type_name(), "set");
        assert!(Value::Undefined.is_undefined());
        assert!(!Value::Null.is_undefined());
    }
}
