use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Message;

/// Shown for any stream failure that is not a cancellation.
pub const STREAM_FAILED_MESSAGE: &str = "Failed to get response from the server.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Malformed stream record: {0}")]
    Parse(String),

    #[error("Server reported an error: {0}")]
    Stream(String),

    #[error("Stream aborted")]
    Aborted,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),
}

impl ChatError {
    /// The single line shown to the user, or `None` for a quiet cancellation.
    ///
    /// A non-2xx answer from the chat endpoint carries its own `{message}` (or a
    /// status-derived fallback), which is shown as-is. Every other failure shows
    /// the fixed text.
    pub fn user_message(&self) -> Option<String> {
        match self {
            ChatError::Aborted => None,
            ChatError::Http { message, .. } => Some(message.clone()),
            _ => Some(STREAM_FAILED_MESSAGE.to_string()),
        }
    }
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// One decoded stream record. Neither field set means there is nothing to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub delta_content: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta_content: Some(text.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delta_content: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub name: String,
}

/// Server-side defaults from `GET /default-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultConfig {
    pub provider: String,
    pub model: String,
}
