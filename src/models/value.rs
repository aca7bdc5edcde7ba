//! Host-side values and result rows.
//!
//! [`Value`] is the tagged scalar exchanged with the embedding runtime in both
//! directions: statement arguments going out, column values coming back.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// A scalar value crossing the bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Only produced for unsigned columns holding values above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Text(String),
    /// Raw bytes, never implicitly decoded to text.
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Interpret a byte value as UTF-8 text.
    ///
    /// Some drivers report textual columns as bytes; decoding is left to the
    /// caller, who knows what the column holds.
    pub fn decode_utf8(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            Self::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(Self::UInt(v), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl Value {
    /// Convert a JSON scalar handed over by a host as the argument at
    /// `position` (1-based).
    pub fn from_json_arg(value: serde_json::Value, position: usize) -> DbResult<Self> {
        use serde_json::Value as JsonValue;

        match value {
            JsonValue::Null => Ok(Self::Null),
            JsonValue::Bool(b) => Ok(Self::Bool(b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(Self::UInt(u))
                } else {
                    n.as_f64().map(Self::Float).ok_or_else(|| {
                        DbError::invalid_argument(position, format!("unrepresentable number {}", n))
                    })
                }
            }
            JsonValue::String(s) => Ok(Self::Text(s)),
            JsonValue::Array(_) => Err(DbError::invalid_argument(
                position,
                "arrays are not valid SQL parameters",
            )),
            JsonValue::Object(_) => Err(DbError::invalid_argument(
                position,
                "objects are not valid SQL parameters",
            )),
        }
    }
}

/// Convert a list of JSON scalars into statement arguments.
pub fn args_from_json(values: impl IntoIterator<Item = serde_json::Value>) -> DbResult<Vec<Value>> {
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| Value::from_json_arg(value, idx + 1))
        .collect()
}

/// Serialize as plain JSON scalars: bytes as base64, temporals as ISO-8601.
impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::UInt(v) => serializer.serialize_u64(*v),
            Self::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            // JSON has no literal for these; use PostgreSQL's spellings
            Self::Float(v) if v.is_nan() => serializer.serialize_str("NaN"),
            Self::Float(v) if *v > 0.0 => serializer.serialize_str("Infinity"),
            Self::Float(_) => serializer.serialize_str("-Infinity"),
            Self::Text(v) => serializer.serialize_str(v),
            Self::Bytes(v) => serializer.serialize_str(&STANDARD.encode(v)),
            Self::Timestamp(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Date(v) => serializer.collect_str(&v.format("%Y-%m-%d")),
            Self::Time(v) => serializer.collect_str(&v.format("%H:%M:%S%.f")),
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One result row: column name to value, in the order the driver reported
/// the columns.
///
/// Duplicate column names (for example from an unaliased join) are kept as
/// separate entries. Name lookups and the map view resolve duplicates to the
/// last column carrying the name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    entries: Vec<(String, Value)>,
}

impl Row {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, column: impl Into<String>, value: Value) {
        self.entries.push((column.into(), value));
    }

    /// Value of the named column (the last one if the name repeats).
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Every value carrying the given column name, in column order.
    pub fn get_all<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.entries
            .iter()
            .filter(move |(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Value at a column position.
    pub fn get_index(&self, index: usize) -> Option<(&str, &Value)> {
        self.entries
            .get(index)
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Number of columns, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map view keyed by column name.
    pub fn to_map(&self) -> IndexMap<String, Value> {
        let mut map = IndexMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            map.insert(name.clone(), value.clone());
        }
        map
    }
}

impl Serialize for Row {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_map().serialize(serializer)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
