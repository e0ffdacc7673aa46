//! The message crossing the bridge in both directions.
//!
//! Routing only ever looks at `name`. Correlation fields are typed; everything
//! else is an open payload that handlers decode into their own shapes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identifier::Identifier;

/// A named message with optional correlation fields and an open payload.
///
/// Wire shape: a single JSON object, e.g.
/// `{"name":"session.cmd.cookies.get","targetID":"3"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    /// Object the message concerns.
    #[serde(rename = "targetID", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Identifier>,

    /// Correlates a callback invocation with its reply.
    #[serde(rename = "callbackId", default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<Identifier>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_id: None,
            callback_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_target(mut self, id: Identifier) -> Self {
        self.target_id = Some(id);
        self
    }

    pub fn with_callback(mut self, id: Identifier) -> Self {
        self.callback_id = Some(id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Serialize `value` into the payload under `key`.
    pub fn try_with_field<T: Serialize + ?Sized>(
        mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        self.payload.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Merge the top-level fields of a struct into the payload.
    ///
    /// `value` must serialize to a JSON object.
    pub fn try_with_fields<T: Serialize + ?Sized>(
        mut self,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => {
                self.payload.extend(fields);
                Ok(self)
            }
            other => Err(serde::ser::Error::custom(format!(
                "payload must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Decode a single payload field. A missing field is an error.
    pub fn decode_field<T: DeserializeOwned>(&self, key: &str) -> Result<T, serde_json::Error> {
        match self.payload.get(key) {
            Some(value) => T::deserialize(value),
            None => Err(serde::de::Error::custom(format!("missing field `{key}`"))),
        }
    }

    /// Decode the whole message (correlation fields included) into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::to_value(self).and_then(serde_json::from_value)
    }

    /// Whether this message is addressed to `id`.
    pub fn targets(&self, id: &Identifier) -> bool {
        self.target_id.as_ref() == Some(id)
    }
}
