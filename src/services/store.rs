use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Conversation, ConversationSummary, Message};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Remote conversation storage. Ids are assigned by the store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, title: &str) -> Result<Conversation, PersistenceError>;

    /// Replace the message log. The returned record is authoritative, including its id.
    async fn update(&self, id: &str, messages: &[Message])
        -> Result<Conversation, PersistenceError>;

    async fn fetch(&self, id: &str) -> Result<Conversation, PersistenceError>;

    async fn remove(&self, id: &str) -> Result<(), PersistenceError>;

    /// No ordering is guaranteed.
    async fn list(&self) -> Result<Vec<ConversationSummary>, PersistenceError>;
}
