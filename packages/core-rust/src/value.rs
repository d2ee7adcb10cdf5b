//! Dynamic values used for payloads, attributes and flow variables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Generic runtime value carried by message payloads, attributes and variables.
///
/// Supports all JSON-compatible types plus binary data and whole messages, so
/// that aggregated results (a list of route outputs, for instance) can be
/// represented without losing each message's attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed map. Uses `BTreeMap` for deterministic iteration order.
    Map(BTreeMap<String, Value>),
    /// A complete message, used by aggregations that collect route outputs.
    Message(Box<Message>),
}

impl Value {
    /// Returns the kind discriminant of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
            Self::Message(_) => ValueKind::Message,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Message(message) => write!(f, "{}", message.payload().value()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Self::Message(Box::new(message))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Discriminant for [`Value`] variants, used by data-type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Array,
    Map,
    Message,
}

/// Data-type tag attached to every payload, attribute set and variable.
///
/// `item` is only set for collections whose element kind is known, e.g. the
/// list a variable becomes when several routes wrote to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataType {
    pub kind: ValueKind,
    pub item: Option<ValueKind>,
    pub media_type: Option<String>,
}

impl DataType {
    /// Infers the data type of a value. Arrays whose elements all share a kind
    /// record that kind as their item type.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        let item = match value {
            Value::Array(items) => {
                let mut kinds = items.iter().map(Value::kind);
                match kinds.next() {
                    Some(first) if kinds.all(|k| k == first) => Some(first),
                    _ => None,
                }
            }
            _ => None,
        };
        Self {
            kind: value.kind(),
            item,
            media_type: None,
        }
    }

    /// A collection whose elements are of the given type.
    #[must_use]
    pub fn list_of(item: &DataType) -> Self {
        Self {
            kind: ValueKind::Array,
            item: Some(item.kind),
            media_type: None,
        }
    }

    #[must_use]
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// A value paired with its data-type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    value: Value,
    data_type: DataType,
}

impl TypedValue {
    /// Wraps a value, inferring its data type.
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        let data_type = DataType::of(&value);
        Self { value, data_type }
    }

    /// Wraps a value with an explicit data type.
    #[must_use]
    pub fn with_type(value: Value, data_type: DataType) -> Self {
        Self { value, data_type }
    }

    #[must_use]
    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}
