//! Readings data model
//!
//! A producer delivers one [`ReadingSnapshot`] per connection: a JSON object
//! mapping hierarchical keys (`climaduino/<host>/readings/temperature`) to
//! scalar values. Only strings, numbers and booleans are accepted.
//!
//! ```text
//! {"climaduino/yun/readings/temp": 21, "climaduino/yun/status/ok": true}
//!        └── key ──────────────────┘  └┘ value
//! ```

pub mod delta;

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ReadingsError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("Reading '{key}' has unsupported {kind} value")]
    UnsupportedValue { key: String, kind: &'static str },
}

/// Scalar value of a single reading
#[derive(Clone, Debug)]
pub enum ReadingValue {
    Text(String),
    Number(Number),
    Bool(bool),
}

impl ReadingValue {
    pub fn from_json(key: &str, value: Value) -> Result<Self, ReadingsError> {
        match value {
            Value::String(s) => Ok(ReadingValue::Text(s)),
            Value::Number(n) => Ok(ReadingValue::Number(n)),
            Value::Bool(b) => Ok(ReadingValue::Bool(b)),
            other => Err(ReadingsError::UnsupportedValue {
                key: key.to_string(),
                kind: json_kind(&other),
            }),
        }
    }

    /// Payload published to the broker. Booleans become `1`/`0`.
    pub fn to_payload(&self) -> String {
        self.to_string()
    }

    fn as_numeric(&self) -> Option<NumericView> {
        match self {
            ReadingValue::Number(n) => Some(NumericView::from(n)),
            ReadingValue::Bool(b) => Some(NumericView::Int(i64::from(*b))),
            ReadingValue::Text(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum NumericView {
    Int(i64),
    Float(f64),
}

impl From<&Number> for NumericView {
    fn from(n: &Number) -> Self {
        match n.as_i64() {
            Some(i) => NumericView::Int(i),
            None => NumericView::Float(n.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

impl PartialEq for NumericView {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (NumericView::Int(a), NumericView::Int(b)) => a == b,
            (NumericView::Int(a), NumericView::Float(b))
            // lossy past 2^53; readings never get that large
            | (NumericView::Float(b), NumericView::Int(a)) => a as f64 == b,
            (NumericView::Float(a), NumericView::Float(b)) => a == b,
        }
    }
}

/// Text compares by exact content. Numbers compare numerically and booleans
/// count as `0`/`1`, so `true == 1` and `21 == 21.0`. Text never equals a
/// number or a boolean.
impl PartialEq for ReadingValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ReadingValue::Text(a), ReadingValue::Text(b)) => a == b,
            (ReadingValue::Text(_), _) | (_, ReadingValue::Text(_)) => false,
            _ => self.as_numeric() == other.as_numeric(),
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadingValue::Text(s) => write!(f, "{}", s),
            ReadingValue::Number(n) => write!(f, "{}", n),
            ReadingValue::Bool(b) => write!(f, "{}", u8::from(*b)),
        }
    }
}

impl From<&str> for ReadingValue {
    fn from(s: &str) -> Self {
        ReadingValue::Text(s.to_string())
    }
}

impl From<String> for ReadingValue {
    fn from(s: String) -> Self {
        ReadingValue::Text(s)
    }
}

impl From<i64> for ReadingValue {
    fn from(i: i64) -> Self {
        ReadingValue::Number(Number::from(i))
    }
}

impl From<i32> for ReadingValue {
    fn from(i: i32) -> Self {
        ReadingValue::Number(Number::from(i))
    }
}

impl From<bool> for ReadingValue {
    fn from(b: bool) -> Self {
        ReadingValue::Bool(b)
    }
}

/// One changed key/value pair, ready to publish
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub key: String,
    pub value: ReadingValue,
}

impl Reading {
    pub fn new(key: impl Into<String>, value: impl Into<ReadingValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, {}", self.key, self.value)
    }
}

/// Full set of current readings delivered by the producer in one message
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadingSnapshot {
    readings: BTreeMap<String, ReadingValue>,
}

impl ReadingSnapshot {
    /// Parses one producer message. A zero-length or whitespace-only payload
    /// yields an empty snapshot.
    pub fn parse(payload: &[u8]) -> Result<Self, ReadingsError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(map) => Self::from_json_map(map),
            other => Err(ReadingsError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn from_json_map(map: Map<String, Value>) -> Result<Self, ReadingsError> {
        let readings = map
            .into_iter()
            .map(|(key, value)| {
                let value = ReadingValue::from_json(&key, value)?;
                Ok((key, value))
            })
            .collect::<Result<BTreeMap<_, _>, ReadingsError>>()?;
        Ok(Self { readings })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ReadingValue>) {
        self.readings.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ReadingValue> {
        self.readings.get(key)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Iterates in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReadingValue)> {
        self.readings.iter()
    }

    pub fn to_json(&self) -> Value {
        let map = self
            .readings
            .iter()
            .map(|(key, value)| {
                let json = match value {
                    ReadingValue::Text(s) => Value::String(s.clone()),
                    ReadingValue::Number(n) => Value::Number(n.clone()),
                    ReadingValue::Bool(b) => Value::Bool(*b),
                };
                (key.clone(), json)
            })
            .collect::<Map<_, _>>();
        Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<ReadingValue>> FromIterator<(K, V)> for ReadingSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            readings: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
