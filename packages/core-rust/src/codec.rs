//! String codec between [`Value`] and driver-level text.
//!
//! # Encoding
//!
//! JSON-native values (null, booleans, integers, finite floats, strings,
//! arrays, string-keyed objects) are written as plain JSON. Everything else
//! is wrapped in a tagged object:
//!
//! ```text
//! {"$type": "date", "value": "2024-01-01T00:00:00Z"}
//! {"$type": "set",  "value": [1, 2, 3]}
//! {"$type": "map",  "value": [[{"$type": "date", ...}, "v"]]}
//! ```
//!
//! An object that itself owns a `$type` field is wrapped as
//! `{"$type": "object", "value": {...}}`, so user data is never read back as
//! a tag.
//!
//! Binary values written through the raw path bypass this codec entirely and
//! use the `base64:` framing from [`serialize_raw`] / [`deserialize_raw`].

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Number, Value as Json};
use url::Url;

use crate::value::Value;

const TYPE_FIELD: &str = "$type";
const VALUE_FIELD: &str = "value";

/// Prefix framing base64-encoded raw values stored in text-only drivers.
pub const RAW_PREFIX: &str = "base64:";

/// Failures converting between [`Value`] and its string form.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("non-finite float {0} cannot be encoded")]
    NonFiniteFloat(f64),
    #[error("unknown value tag `{0}`")]
    UnknownTag(String),
    #[error("malformed `{tag}` value: {reason}")]
    Malformed { tag: String, reason: String },
}

/// Encodes a value to its string form.
///
/// # Errors
///
/// Returns [`CodecError::NonFiniteFloat`] for NaN or infinite floats anywhere
/// in the value.
pub fn stringify(value: &Value) -> Result<String, CodecError> {
    let json = to_json(value)?;
    Ok(serde_json::to_string(&json)?)
}

/// Decodes a string produced by [`stringify`].
///
/// # Errors
///
/// Returns [`CodecError::Json`] for text that is not JSON, and
/// [`CodecError::UnknownTag`] / [`CodecError::Malformed`] for tagged objects
/// that do not describe a known value type.
pub fn parse(text: &str) -> Result<Value, CodecError> {
    let json: Json = serde_json::from_str(text)?;
    from_json(json)
}

/// Frames binary data for storage in a text-only driver.
#[must_use]
pub fn serialize_raw(bytes: &[u8]) -> String {
    format!("{RAW_PREFIX}{}", STANDARD.encode(bytes))
}

/// Reverses [`serialize_raw`]. Text without the `base64:` frame is returned
/// as its UTF-8 bytes.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] when the frame is present but its
/// payload is not valid base64.
pub fn deserialize_raw(text: &str) -> Result<Bytes, CodecError> {
    match text.strip_prefix(RAW_PREFIX) {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| malformed("raw", e)),
        None => Ok(Bytes::copy_from_slice(text.as_bytes())),
    }
}

fn tagged(tag: &str, value: Json) -> Json {
    let mut fields = JsonMap::with_capacity(2);
    fields.insert(TYPE_FIELD.to_string(), Json::String(tag.to_string()));
    fields.insert(VALUE_FIELD.to_string(), value);
    Json::Object(fields)
}

fn malformed(tag: &str, reason: impl std::fmt::Display) -> CodecError {
    CodecError::Malformed {
        tag: tag.to_string(),
        reason: reason.to_string(),
    }
}

fn to_json_list(items: &[Value]) -> Result<Json, CodecError> {
    items
        .iter()
        .map(to_json)
        .collect::<Result<Vec<_>, _>>()
        .map(Json::Array)
}

fn to_json(value: &Value) -> Result<Json, CodecError> {
    Ok(match value {
        Value::Undefined => tagged("undefined", Json::Null),
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => Number::from_f64(*f)
            .map(Json::Number)
            .ok_or(CodecError::NonFiniteFloat(*f))?,
        Value::BigInt(n) => tagged("bigint", Json::String(n.to_string())),
        Value::String(s) => Json::String(s.clone()),
        Value::Date(d) => tagged(
            "date",
            Json::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ),
        Value::Url(u) => tagged("url", Json::String(u.to_string())),
        Value::Error { name, message } => {
            let mut fields = JsonMap::with_capacity(2);
            fields.insert("name".to_string(), Json::String(name.clone()));
            fields.insert("message".to_string(), Json::String(message.clone()));
            tagged("error", Json::Object(fields))
        }
        Value::Bytes(b) => tagged("bytes", Json::String(STANDARD.encode(b))),
        Value::Array(items) => to_json_list(items)?,
        Value::Set(items) => tagged("set", to_json_list(items)?),
        Value::Map(entries) => {
            let pairs = entries
                .iter()
                .map(|(k, v)| Ok(Json::Array(vec![to_json(k)?, to_json(v)?])))
                .collect::<Result<Vec<_>, CodecError>>()?;
            tagged("map", Json::Array(pairs))
        }
        Value::Object(fields) => {
            let object = fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v)?)))
                .collect::<Result<JsonMap<_, _>, CodecError>>()?;
            if fields.contains_key(TYPE_FIELD) {
                tagged("object", Json::Object(object))
            } else {
                Json::Object(object)
            }
        }
    })
}

fn from_json(json: Json) -> Result<Value, CodecError> {
    Ok(match json {
        Json::Object(mut fields) => match fields.remove(TYPE_FIELD) {
            Some(Json::String(tag)) => {
                let payload = fields.remove(VALUE_FIELD).unwrap_or(Json::Null);
                from_tagged(&tag, payload)?
            }
            Some(other) => return Err(malformed("tag", format!("non-string tag {other}"))),
            None => Value::Object(from_json_object(fields)?),
        },
        Json::Array(items) => Value::Array(from_json_list(items)?),
        other => Value::from(other),
    })
}

fn from_json_list(items: Vec<Json>) -> Result<Vec<Value>, CodecError> {
    items.into_iter().map(from_json).collect()
}

fn from_json_object(fields: JsonMap<String, Json>) -> Result<BTreeMap<String, Value>, CodecError> {
    fields
        .into_iter()
        .map(|(k, v)| Ok((k, from_json(v)?)))
        .collect()
}

fn expect_string(tag: &str, payload: Json) -> Result<String, CodecError> {
    match payload {
        Json::String(s) => Ok(s),
        other => Err(malformed(tag, format!("expected string, got {other}"))),
    }
}

fn expect_array(tag: &str, payload: Json) -> Result<Vec<Json>, CodecError> {
    match payload {
        Json::Array(items) => Ok(items),
        other => Err(malformed(tag, format!("expected array, got {other}"))),
    }
}

fn from_tagged(tag: &str, payload: Json) -> Result<Value, CodecError> {
    Ok(match tag {
        "undefined" => Value::Undefined,
        "bigint" => {
            let digits = expect_string(tag, payload)?;
            Value::BigInt(digits.parse().map_err(|e| malformed(tag, e))?)
        }
        "date" => {
            let text = expect_string(tag, payload)?;
            let parsed = DateTime::parse_from_rfc3339(&text).map_err(|e| malformed(tag, e))?;
            Value::Date(parsed.with_timezone(&Utc))
        }
        "url" => {
            let text = expect_string(tag, payload)?;
            Value::Url(Url::parse(&text).map_err(|e| malformed(tag, e))?)
        }
        "error" => {
            let Json::Object(mut fields) = payload else {
                return Err(malformed(tag, "expected object"));
            };
            let name = fields.remove("name").unwrap_or(Json::Null);
            let message = fields.remove("message").unwrap_or(Json::Null);
            Value::Error {
                name: expect_string(tag, name)?,
                message: expect_string(tag, message)?,
            }
        }
        "bytes" => {
            let encoded = expect_string(tag, payload)?;
            Value::Bytes(STANDARD.decode(encoded).map_err(|e| malformed(tag, e))?)
        }
        "set" => Value::Set(from_json_list(expect_array(tag, payload)?)?),
        "map" => {
            let mut entries = Vec::new();
            for pair in expect_array(tag, payload)? {
                let mut pair = expect_array(tag, pair)?.into_iter();
                match (pair.next(), pair.next(), pair.next()) {
                    (Some(k), Some(v), None) => entries.push((from_json(k)?, from_json(v)?)),
                    _ => return Err(malformed(tag, "entries must be [key, value] pairs")),
                }
            }
            Value::Map(entries)
        }
        "object" => match payload {
            Json::Object(fields) => Value::Object(from_json_object(fields)?),
            other => return Err(malformed(tag, format!("expected object, got {other}"))),
        },
        unknown => return Err(CodecError::UnknownTag(unknown.to_string())),
    })
}
