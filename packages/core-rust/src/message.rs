//! Messages: an opaque payload plus attributes.

use serde::{Deserialize, Serialize};

use crate::value::{TypedValue, Value};

/// Payload container exchanged between processors.
///
/// The routing core reads and re-packages messages but never interprets the
/// payload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    payload: TypedValue,
    attributes: TypedValue,
}

impl Message {
    /// Creates a message with the given payload and no attributes.
    pub fn of(payload: impl Into<Value>) -> Self {
        Self {
            payload: TypedValue::new(payload),
            attributes: TypedValue::null(),
        }
    }

    #[must_use]
    pub fn new(payload: TypedValue, attributes: TypedValue) -> Self {
        Self {
            payload,
            attributes,
        }
    }

    /// An empty message (null payload, null attributes).
    #[must_use]
    pub fn empty() -> Self {
        Self::of(Value::Null)
    }

    #[must_use]
    pub fn payload(&self) -> &TypedValue {
        &self.payload
    }

    #[must_use]
    pub fn attributes(&self) -> &TypedValue {
        &self.attributes
    }

    #[must_use]
    pub fn with_payload(mut self, payload: TypedValue) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: TypedValue) -> Self {
        self.attributes = attributes;
        self
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty()
    }
}
