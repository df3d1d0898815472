//! Payload shapes used by the reference routes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound text from a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Message text.
    pub message: String,
    /// Sender name.
    #[serde(default)]
    pub user: String,
}

impl ChatRequest {
    /// Build a request.
    pub fn new(message: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user: user.into(),
        }
    }
}

/// Server reply to a [`ChatRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    /// Reply text.
    pub response: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Fixed identity of the route that answered.
    pub server_info: String,
    /// Channel counter value, when the reply came from a channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl ChatResponse {
    /// Build a reply stamped with the current time.
    pub fn new(response: impl Into<String>, server_info: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            timestamp: Utc::now().to_rfc3339(),
            server_info: server_info.into(),
            sequence: None,
        }
    }

    /// Attach a channel counter value.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A message with an optional id, used by fire-and-forget and stream routes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique id, assigned by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message body.
    pub content: String,
    /// Who produced it.
    pub sender: String,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Build a message stamped with the current time and no id.
    pub fn new(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            sender: sender.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Attach an id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
