//! Dynamic values carried by calls and messages.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// 12-byte object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let id: [u8; 12] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Regular expression source with its flags. Never compiled here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegexValue {
    pub source: String,
    pub global: bool,
    pub ignore_case: bool,
    pub multiline: bool,
}

impl RegexValue {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub(crate) fn flag_byte(&self) -> u8 {
        (self.global as u8) | (self.ignore_case as u8) << 1 | (self.multiline as u8) << 2
    }

    pub(crate) fn with_flag_byte(source: String, flags: u8) -> Self {
        Self {
            source,
            global: flags & 0x01 != 0,
            ignore_case: flags & 0x02 != 0,
            multiline: flags & 0x04 != 0,
        }
    }
}

/// A value that can be encoded against a [`Type`](crate::Type).
///
/// Objects map field names to values; an optional field is absent when its
/// key is missing or holds [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Uint(u64),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Bool(bool),
    Json(serde_json::Value),
    ObjectId(ObjectId),
    Regex(RegexValue),
    /// Millisecond precision on the wire. `From<DateTime<Utc>>` truncates.
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Starts an empty object value.
    pub fn object() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Looks up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Returns the value as an unsigned integer, accepting non-negative ints.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(u) => Some(u),
            Value::Int(i) => u64::try_from(i).ok(),
            _ => None,
        }
    }

    /// Returns the value as a signed integer, accepting uints in range.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            Value::Uint(u) => i64::try_from(u).ok(),
            _ => None,
        }
    }

    /// Returns the value as a float, accepting any integer.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(f) => Some(f),
            Value::Int(i) => Some(i as f64),
            Value::Uint(u) => Some(u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Builder for [`Value::Object`].
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    fields: BTreeMap<String, Value>,
}

impl ObjectBuilder {
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<ObjectBuilder> for Value {
    fn from(builder: ObjectBuilder) -> Self {
        builder.build()
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<RegexValue> for Value {
    fn from(v: RegexValue) -> Self {
        Value::Regex(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v.trunc_subsecs(3))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
