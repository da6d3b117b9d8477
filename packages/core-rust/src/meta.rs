//! Per-key metadata returned by `get_meta`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::value::Value;

/// Metadata about a stored key.
///
/// Drivers with native metadata (e.g. file stat) fill the well-known
/// fields; user metadata written through `set_meta` lands in `extra` unless
/// it uses one of the well-known names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageMeta {
    /// Last access time.
    pub atime: Option<DateTime<Utc>>,
    /// Last modification time.
    pub mtime: Option<DateTime<Utc>>,
    /// Time-to-live in seconds.
    pub ttl: Option<u64>,
    /// Size of the stored value in bytes.
    pub size: Option<u64>,
    /// Any other metadata fields.
    pub extra: BTreeMap<String, Value>,
}

impl StorageMeta {
    /// Returns `true` if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atime.is_none()
            && self.mtime.is_none()
            && self.ttl.is_none()
            && self.size.is_none()
            && self.extra.is_empty()
    }

    /// Overlays `other` on top of `self`: fields set in `other` win.
    pub fn merge(&mut self, other: StorageMeta) {
        if other.atime.is_some() {
            self.atime = other.atime;
        }
        if other.mtime.is_some() {
            self.mtime = other.mtime;
        }
        if other.ttl.is_some() {
            self.ttl = other.ttl;
        }
        if other.size.is_some() {
            self.size = other.size;
        }
        self.extra.extend(other.extra);
    }

    /// Converts to an object value for storage under the companion key.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut fields = self.extra.clone();
        if let Some(atime) = self.atime {
            fields.insert("atime".to_string(), Value::Date(atime));
        }
        if let Some(mtime) = self.mtime {
            fields.insert("mtime".to_string(), Value::Date(mtime));
        }
        if let Some(ttl) = self.ttl {
            fields.insert("ttl".to_string(), integer(ttl));
        }
        if let Some(size) = self.size {
            fields.insert("size".to_string(), integer(size));
        }
        Value::Object(fields)
    }

    /// Reads metadata back from a stored object value.
    ///
    /// Times may be stored as dates or as RFC 3339 strings. A non-object
    /// value yields empty metadata.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let atime = fields.remove("atime").and_then(as_time);
        let mtime = fields.remove("mtime").and_then(as_time);
        let ttl = fields.remove("ttl").and_then(as_unsigned);
        let size = fields.remove("size").and_then(as_unsigned);
        Self {
            atime,
            mtime,
            ttl,
            size,
            extra: fields,
        }
    }
}

fn integer(n: u64) -> Value {
    i64::try_from(n).map_or(Value::BigInt(i128::from(n)), Value::Int)
}

fn as_time(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Date(d) => Some(d),
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn as_unsigned(value: Value) -> Option<u64> {
    match value {
        Value::Int(i) => u64::try_from(i).ok(),
        Value::BigInt(i) => u64::try_from(i).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn value_round_trip_keeps_known_and_extra_fields() {
        let meta = StorageMeta {
            mtime: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ttl: Some(60),
            extra: BTreeMap::from([("owner".to_string(), Value::from("ops"))]),
            ..StorageMeta::default()
        };
        assert_eq!(StorageMeta::from_value(meta.to_value()), meta);
    }

    #[test]
    fn string_times_are_accepted() {
        let value = Value::object([("atime", Value::from("2024-05-01T10:00:00Z"))]);
        let meta = StorageMeta::from_value(value);
        assert_eq!(
            meta.atime,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn merge_prefers_incoming_fields() {
        let mut base = StorageMeta {
            size: Some(10),
            ttl: Some(5),
            ..StorageMeta::default()
        };
        base.merge(StorageMeta {
            ttl: Some(30),
            ..StorageMeta::default()
        });
        assert_eq!(base.size, Some(10));
        assert_eq!(base.ttl, Some(30));
    }

    #[test]
    fn non_object_is_empty() {
        assert!(StorageMeta::from_value(Value::Int(1)).is_empty());
    }
}
