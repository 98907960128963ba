use serde::{Deserialize, Serialize};

use super::types::{ModelInfo, StreamEvent};
use crate::models::Message;

// --- Streaming types ---

/// `{choices: [{delta: {content?}}]} | {error}`
#[derive(Debug, Deserialize)]
pub struct StreamPayload {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub error: Option<StreamErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StreamErrorBody {
    Message(String),
    Detail { message: String },
}

impl From<StreamPayload> for StreamEvent {
    fn from(payload: StreamPayload) -> Self {
        let error = payload.error.map(|e| match e {
            StreamErrorBody::Message(message) | StreamErrorBody::Detail { message } => message,
        });
        let delta_content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content);
        StreamEvent {
            delta_content,
            error,
        }
    }
}

// --- Conversation requests ---

#[derive(Debug, Serialize)]
pub struct CreateConversationBody<'a> {
    pub title: &'a str,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct UpdateConversationBody<'a> {
    pub messages: &'a [Message],
}

// --- Misc endpoints ---

#[derive(Debug, Deserialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// --- Error types ---

/// Non-2xx bodies: `{message}` from the chat proxy, `{detail}` from the framework.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub message: Option<String>,
    pub detail: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn into_message(self) -> Option<String> {
        if let Some(message) = self.message {
            return Some(message);
        }
        match self.detail? {
            serde_json::Value::String(detail) => Some(detail),
            other => Some(other.to_string()),
        }
    }
}
