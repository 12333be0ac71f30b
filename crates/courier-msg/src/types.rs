//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::Result;

/// Content type stamped on JSON bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Opaque token linking a reply to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a collision-resistant identifier (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Transport-level metadata carried beside the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Unique identifier for tracing.
    pub message_id: Uuid,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the request this message belongs to.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Queue the receiver should publish its reply to. Absent for one-way messages.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// MIME type of the body.
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            content_type: None,
        }
    }
}

/// Unit of transport: metadata plus an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Metadata such as correlation id and reply address.
    pub properties: MessageProperties,
    /// Serialized payload, opaque to the transport.
    pub body: Bytes,
}

impl Message {
    /// Construct a message around raw body bytes.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            properties: MessageProperties::default(),
            body: body.into(),
        }
    }

    /// Construct a message whose body is the JSON encoding of `value`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        let mut message = Self::new(body);
        message.properties.content_type = Some(CONTENT_TYPE_JSON.to_owned());
        Ok(message)
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.properties.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a reply address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Correlation id carried by the message, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.properties.correlation_id.as_ref()
    }

    /// Reply address carried by the message, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Decode the body as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Lossy UTF-8 preview of the body for diagnostics.
    pub fn body_preview(&self, limit: usize) -> String {
        let text = String::from_utf8_lossy(&self.body);
        if text.chars().count() <= limit {
            return text.into_owned();
        }
        let mut preview: String = text.chars().take(limit).collect();
        preview.push_str("...");
        preview
    }
}

/// Request envelope addressed to a multi-action queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action name used for routing, e.g. `user/signin`.
    pub action: String,
    /// Action payload.
    #[serde(default)]
    pub data: JsonValue,
}

impl ActionRequest {
    /// Construct an action request.
    pub fn new(action: impl Into<String>, data: JsonValue) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

/// Stable codes carried in error-shaped replies.
pub mod error_codes {
    /// No handler is registered for the requested action.
    pub const NO_SUCH_ACTION: &str = "no_such_action";
    /// The handler returned an error or panicked.
    pub const HANDLER_ERROR: &str = "handler_error";
    /// The handler exceeded the dispatcher's handler timeout.
    pub const HANDLER_TIMEOUT: &str = "handler_timeout";
    /// The request body could not be decoded.
    pub const DECODE_ERROR: &str = "decode_error";
}

/// Error-shaped reply body: `{"error": "...", "code": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable failure description.
    pub error: String,
    /// Machine-readable failure class, see [`error_codes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorReply {
    /// Construct an error reply with a code.
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_owned()),
        }
    }

    /// Recognise an error-shaped reply body.
    ///
    /// Only objects whose `error` member is a string qualify; successful results are
    /// arbitrary JSON and may legitimately contain other members such as `message`.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        let object = value.as_object()?;
        let error = object.get("error")?.as_str()?.to_owned();
        let code = object
            .get("code")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);
        Some(Self { error, code })
    }

    /// JSON representation sent over the wire.
    pub fn to_value(&self) -> JsonValue {
        let mut object = serde_json::Map::new();
        object.insert("error".into(), JsonValue::from(self.error.clone()));
        if let Some(code) = &self.code {
            object.insert("code".into(), JsonValue::from(code.clone()));
        }
        JsonValue::Object(object)
    }
}
