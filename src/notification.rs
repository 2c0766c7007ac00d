//! Notification events pushed by the server.
//!
//! A MESSAGE body is a JSON object:
//!
//! ```json
//! {"type": "low_stock", "title": "Low stock", "message": "SKU-42 below 5", "data": {"sku": "SKU-42"}}
//! ```
//!
//! `type` defaults to `"info"`, `title` and `message` to empty strings.
//! Top-level fields other than the four above are folded into `data` so
//! nothing the server sends is silently lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Event type used when the payload does not name one.
pub const DEFAULT_KIND: &str = "info";

/// A decoded notification, alive only for the duration of its dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Event type (`info`, `success`, `warning`, `error`, or domain specific).
    #[serde(rename = "type")]
    pub kind: String,
    /// Short headline.
    pub title: String,
    /// Human-readable text.
    pub message: String,
    /// Opaque payload for application listeners.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NotificationEvent {
    /// Build an event with empty data.
    #[must_use]
    pub fn new(kind: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            data: Map::new(),
        }
    }

    /// Decode a MESSAGE body.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::FrameParse`] when the body is not UTF-8 JSON
    /// or not a JSON object.
    pub fn decode(body: &[u8]) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ClientError::FrameParse(format!("notification body is not JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(ClientError::FrameParse(
                "notification body is not a JSON object".to_string(),
            ));
        };

        let kind = take_text(&mut fields, "type").unwrap_or_else(|| DEFAULT_KIND.to_string());
        let title = take_text(&mut fields, "title").unwrap_or_default();
        let message = take_text(&mut fields, "message").unwrap_or_default();

        let mut data = match fields.remove("data") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        for (key, value) in fields {
            data.entry(key).or_insert(value);
        }

        Ok(Self {
            kind,
            title,
            message,
            data,
        })
    }

    /// Severity derived from the event type.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_kind(&self.kind)
    }
}

/// Presentation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Neutral information.
    Info,
    /// Completed action.
    Success,
    /// Needs attention.
    Warning,
    /// Failure.
    Error,
}

impl Level {
    /// Map an event type onto a severity. Unknown types are `Info`.
    #[must_use]
    pub fn from_kind(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "warning" | "warn" | "low_stock" => Self::Warning,
            "error" | "danger" | "out_of_stock" => Self::Error,
            _ => Self::Info,
        }
    }

    /// Upper-case label for text rendering.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

fn take_text(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
