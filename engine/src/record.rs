//! Record and collection types.
//!
//! Records are opaque JSON objects owned by the application. The engine only
//! looks at two fields: `id` (identity within a collection) and `updatedAt`
//! (last modification time). Records are treated as immutable values; the
//! engine replaces them but never edits one in place.

use crate::{error::Result, Timestamp};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the record identifier.
pub const ID_FIELD: &str = "id";

/// Field holding the last modification time.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// A single application record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create a record from a JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Build a record from any JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// The raw `id` value, if present.
    pub fn id(&self) -> Option<&Value> {
        self.0.get(ID_FIELD).filter(|v| !v.is_null())
    }

    /// Canonical key for the id.
    ///
    /// This is the JSON text of the id, so the number `1` and the string `"1"`
    /// are different keys.
    pub fn key(&self) -> Option<String> {
        self.id().map(Value::to_string)
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// All fields of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Return a copy of this record with one field replaced.
    pub fn with_field(&self, field: impl Into<String>, value: Value) -> Self {
        let mut fields = self.0.clone();
        fields.insert(field.into(), value);
        Self(fields)
    }

    /// `updatedAt` as milliseconds since the epoch; missing or unparseable is 0.
    pub fn updated_at_millis(&self) -> Timestamp {
        self.get(UPDATED_AT_FIELD).map(timestamp_millis).unwrap_or(0)
    }

    /// Consume the record and return its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Parse a timestamp value into epoch milliseconds.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS[.f]` strings (read as
/// UTC), date-only `YYYY-MM-DD` strings (midnight UTC) and numeric epoch
/// milliseconds. Everything else maps to 0.
pub fn timestamp_millis(value: &Value) -> Timestamp {
    match value {
        Value::String(s) => parse_timestamp(s).unwrap_or(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// An ordered sequence of records.
///
/// Order is preserved exactly as given; it is part of the collection's
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(Vec<Record>);

impl Collection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the collection has no records.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over records in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.0.iter()
    }

    /// Records as a slice.
    pub fn records(&self) -> &[Record] {
        &self.0
    }

    /// Append a record.
    pub fn push(&mut self, record: Record) {
        self.0.push(record);
    }

    /// Find the first record with the given id key.
    pub fn find(&self, key: &str) -> Option<&Record> {
        self.0.iter().find(|r| r.key().as_deref() == Some(key))
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON. Anything but an array of objects is rejected.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Consume the collection and return its records.
    pub fn into_records(self) -> Vec<Record> {
        self.0
    }
}

impl From<Vec<Record>> for Collection {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Collection {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
