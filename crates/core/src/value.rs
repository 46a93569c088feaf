//! Scalar value model shared by the cache and the cursor.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::id::RecordId;

/// Textual encoding of dates on the wire and in data files.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Textual encoding of datetimes on the wire and in data files.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Language every translatable value falls back to.
pub const DEFAULT_LANG: &str = "en_US";

/// A single stored or cached value.
///
/// `Null` doubles as "unset" / "false" for every field kind except booleans.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Binary(Vec<u8>),
    /// Single reference to a row of another table.
    Id(RecordId),
    /// Ordered multi reference (cache form of x2many fields).
    Ids(Vec<RecordId>),
    /// Translatable text keyed by language code.
    Translated(BTreeMap<String, String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness the way domain constants and booleans see it.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Binary(b) => !b.is_empty(),
            Value::Ids(ids) => !ids.is_empty(),
            Value::Translated(map) => !map.is_empty(),
            Value::Date(_) | Value::DateTime(_) | Value::Id(_) => true,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.is_truthy()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Id(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Translated(map) => map.get(DEFAULT_LANG).map(String::as_str),
            _ => None,
        }
    }

    /// Referenced id of a single-ref value.
    pub fn as_id(&self) -> Option<RecordId> {
        match self {
            Value::Id(id) => Some(*id),
            Value::Int(id) if *id > 0 => Some(*id),
            _ => None,
        }
    }

    /// Referenced ids of any relational value (empty for null).
    pub fn as_ids(&self) -> Vec<RecordId> {
        match self {
            Value::Ids(ids) => ids.clone(),
            Value::Id(id) => vec![*id],
            _ => Vec::new(),
        }
    }

    /// Text of a translatable value in `lang`, falling back to the default language.
    pub fn translation(&self, lang: &str) -> Option<&str> {
        match self {
            Value::Translated(map) => map
                .get(lang)
                .or_else(|| map.get(DEFAULT_LANG))
                .or_else(|| map.values().next())
                .map(String::as_str),
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Stable variant name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Binary(_) => "binary",
            Value::Id(_) => "reference",
            Value::Ids(_) => "references",
            Value::Translated(_) => "translated text",
        }
    }

    /// Total order used for sorting. Nulls sort after everything else.
    ///
    /// Values of different kinds compare numerically when both are numbers,
    /// otherwise by kind name so the order stays deterministic.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            _ => self.partial_cmp_value(other).unwrap_or_else(|| {
                self.type_name().cmp(other.type_name())
            }),
        }
    }

    /// Comparison used by domain operators. `None` when the kinds are incomparable.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Id(a), Value::Id(b)) => Some(a.cmp(b)),
            (Value::Id(a), Value::Int(b)) | (Value::Int(a), Value::Id(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::DateTime(b)) => Some(a.and_hms_opt(0, 0, 0)?.cmp(b)),
            (Value::DateTime(a), Value::Date(b)) => Some(a.cmp(&b.and_hms_opt(0, 0, 0)?)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Translated(_), _) | (_, Value::Translated(_)) => {
                let a = self.translation(DEFAULT_LANG)?;
                let b = other.translation(DEFAULT_LANG)?;
                Some(a.cmp(b))
            }
            _ => None,
        }
    }

    /// Loose equality used by domain `=`/`in`: numbers compare across kinds.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), b) | (b, Value::Bool(a)) if !matches!(b, Value::Bool(_)) => {
                *a == b.is_truthy()
            }
            _ => self.partial_cmp_value(other) == Some(Ordering::Equal),
        }
    }

    /// Generic JSON rendering (dates as text, binaries as base64).
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Bool(false),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) | Value::Id(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::String(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(dt) => JsonValue::String(dt.format(DATETIME_FORMAT).to_string()),
            Value::Binary(bytes) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            Value::Ids(ids) => JsonValue::Array(ids.iter().map(|i| JsonValue::from(*i)).collect()),
            Value::Translated(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime(value)
    }
}

/// Parse a `YYYY-MM-DD` date (a datetime string is truncated to its date).
pub fn parse_date(raw: &str) -> OrmResult<NaiveDate> {
    let raw = raw.trim();
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, DATE_FORMAT)
        .map_err(|e| OrmError::validation(format!("invalid date '{raw}': {e}")))
}

/// Parse a `YYYY-MM-DD HH:MM:SS` datetime; ISO `T` separators and bare dates are accepted.
pub fn parse_datetime(raw: &str) -> OrmResult<NaiveDateTime> {
    let raw = raw.trim();
    let normalized = raw.replacen('T', " ", 1);
    let normalized = normalized.trim_end_matches('Z');
    let without_fraction = normalized.split('.').next().unwrap_or(normalized);
    if let Ok(dt) = NaiveDateTime::parse_from_str(without_fraction, DATETIME_FORMAT) {
        return Ok(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(without_fraction, DATE_FORMAT) {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(OrmError::validation(format!("invalid datetime '{raw}'")))
}

/// Decode a base64 payload.
pub fn decode_binary(raw: &str) -> OrmResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| OrmError::validation(format!("invalid base64 payload: {e}")))
}
