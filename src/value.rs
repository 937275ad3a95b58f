//! Runtime value representation flowing through the plan evaluator.
//!
//! Values cross the engine boundary as JSON. Scalars that JSON cannot
//! represent unambiguously (big integers, decimals, datetimes, bytes, raw
//! JSON) are wrapped in a `{"$type": ..., "value": ...}` envelope so the
//! client can decode them without guessing.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Untyped value produced and consumed by the query-plan interpreter.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// UTF-8 string.
    Text(String),
    /// Binary payload. Serialized as a base64 `Bytes` envelope.
    Bytes(Vec<u8>),
    /// Integer that must round-trip without floating point loss.
    /// Serialized as a `BigInt` envelope holding a decimal string.
    BigInt(i64),
    /// Arbitrary-precision numeric kept in its textual form.
    Decimal(String),
    /// Timezone-qualified ISO 8601 timestamp.
    DateTime(String),
    /// Raw JSON document kept as text.
    Json(String),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed record.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable name of the value's runtime type, used in errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::BigInt(_) => "bigint",
            Value::Decimal(_) => "decimal",
            Value::DateTime(_) => "datetime",
            Value::Json(_) => "json",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    /// Returns true for `Null` and for empty lists.
    pub fn is_empty_like(&self) -> bool {
        match self {
            Value::Null => true,
            Value::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Converts a decoded JSON document into a runtime value, recognizing
    /// `{"$type", "value"}` envelopes at any nesting depth.
    pub fn from_json(raw: serde_json::Value) -> Result<Value, ValueDecodeError> {
        match raw {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(ValueDecodeError::new(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(map) => Value::from_json_object(map),
        }
    }

    fn from_json_object(
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Value, ValueDecodeError> {
        if map.len() == 2 && map.contains_key("$type") && map.contains_key("value") {
            let tag = map["$type"].as_str().unwrap_or_default().to_owned();
            let payload = map["value"].clone();
            return Value::from_envelope(&tag, payload);
        }
        let mut object = BTreeMap::new();
        for (key, value) in map {
            object.insert(key, Value::from_json(value)?);
        }
        Ok(Value::Object(object))
    }

    fn from_envelope(tag: &str, payload: serde_json::Value) -> Result<Value, ValueDecodeError> {
        match tag {
            "BigInt" => match payload {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .map(Value::BigInt)
                    .ok_or_else(|| ValueDecodeError::new("BigInt out of 64-bit range")),
                serde_json::Value::String(s) => s
                    .parse::<i64>()
                    .map(Value::BigInt)
                    .map_err(|e| ValueDecodeError::new(format!("invalid BigInt '{s}': {e}"))),
                other => Err(ValueDecodeError::new(format!(
                    "BigInt envelope must hold a number or string, got {other}"
                ))),
            },
            "Decimal" => match payload {
                serde_json::Value::String(s) => Ok(Value::Decimal(s)),
                serde_json::Value::Number(n) => Ok(Value::Decimal(n.to_string())),
                other => Err(ValueDecodeError::new(format!(
                    "Decimal envelope must hold a number or string, got {other}"
                ))),
            },
            "DateTime" => match payload {
                serde_json::Value::String(s) => Ok(Value::DateTime(s)),
                other => Err(ValueDecodeError::new(format!(
                    "DateTime envelope must hold a string, got {other}"
                ))),
            },
            "Json" => match payload {
                serde_json::Value::String(s) => Ok(Value::Json(s)),
                other => Err(ValueDecodeError::new(format!(
                    "Json envelope must hold a string, got {other}"
                ))),
            },
            "Bytes" => match payload {
                serde_json::Value::String(s) => base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map(Value::Bytes)
                    .map_err(|e| ValueDecodeError::new(format!("invalid base64 payload: {e}"))),
                other => Err(ValueDecodeError::new(format!(
                    "Bytes envelope must hold a base64 string, got {other}"
                ))),
            },
            other => Err(ValueDecodeError::new(format!(
                "unknown value envelope tag '{other}'"
            ))),
        }
    }
}

/// Failure to decode a JSON document into a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValueDecodeError {
    message: String,
}

impl ValueDecodeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

fn serialize_envelope<S: Serializer>(
    serializer: S,
    tag: &str,
    value: impl Serialize,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(2))?;
    map.serialize_entry("$type", tag)?;
    map.serialize_entry("value", &value)?;
    map.end()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => serialize_envelope(
                serializer,
                "Bytes",
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ),
            Value::BigInt(i) => serialize_envelope(serializer, "BigInt", i.to_string()),
            Value::Decimal(s) => serialize_envelope(serializer, "Decimal", s),
            Value::DateTime(s) => serialize_envelope(serializer, "DateTime", s),
            Value::Json(s) => serialize_envelope(serializer, "Json", s),
            Value::List(items) => items.serialize(serializer),
            Value::Object(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(raw).map_err(D::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unprintable>"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
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

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}
