use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::store::{ConversationStore, PersistenceError};
use crate::models::{Conversation, ConversationSummary, Message};

/// A message-log snapshot waiting for its quiet period to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    deadline: Instant,
}

/// Trailing debounce of log saves, keyed by conversation id.
///
/// Every `schedule` re-arms the timer for that id. While a stream is active no
/// deadline is reported; when streaming ends, pending saves are re-armed from
/// that moment. The clock is passed in so the policy can be driven by tests.
#[derive(Debug)]
pub struct SaveDebouncer {
    delay: Duration,
    pending: HashMap<String, PendingSave>,
    streaming: bool,
}

impl SaveDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
            streaming: false,
        }
    }

    pub fn schedule(&mut self, conversation_id: &str, messages: Vec<Message>, now: Instant) {
        self.pending.insert(
            conversation_id.to_string(),
            PendingSave {
                conversation_id: conversation_id.to_string(),
                messages,
                deadline: now + self.delay,
            },
        );
    }

    pub fn set_streaming(&mut self, streaming: bool, now: Instant) {
        if self.streaming && !streaming {
            let deadline = now + self.delay;
            for save in self.pending.values_mut() {
                save.deadline = save.deadline.max(deadline);
            }
        }
        self.streaming = streaming;
    }

    #[cfg(test)]
    pub fn has_pending(&self, conversation_id: &str) -> bool {
        self.pending.contains_key(conversation_id)
    }

    /// Earliest deadline, or `None` when nothing may be written right now.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.streaming {
            return None;
        }
        self.pending.values().map(|s| s.deadline).min()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<PendingSave> {
        if self.streaming {
            return Vec::new();
        }
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, save)| save.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Everything pending, regardless of deadlines. Used on shutdown.
    pub fn take_all(&mut self) -> Vec<PendingSave> {
        self.pending.drain().map(|(_, save)| save).collect()
    }

    pub fn cancel(&mut self, conversation_id: &str) {
        self.pending.remove(conversation_id);
    }
}

/// Result of writing one debounced snapshot.
#[derive(Debug)]
pub struct SaveOutcome {
    pub requested_id: String,
    pub result: Result<String, PersistenceError>,
}

/// Best-effort writer in front of the remote store.
pub struct PersistenceSync {
    store: Arc<dyn ConversationStore>,
    debouncer: SaveDebouncer,
}

impl PersistenceSync {
    pub fn new(store: Arc<dyn ConversationStore>, debounce: Duration) -> Self {
        Self {
            store,
            debouncer: SaveDebouncer::new(debounce),
        }
    }

    pub async fn create(&self, title: &str) -> Result<Conversation, PersistenceError> {
        let conv = self.store.create(title).await?;
        tracing::info!("Created conversation {} ({})", conv.id, conv.title);
        Ok(conv)
    }

    /// Write the log and return the id the store reports as authoritative.
    pub async fn save(&self, id: &str, messages: &[Message]) -> Result<String, PersistenceError> {
        let updated = self.store.update(id, messages).await?;
        if updated.id != id {
            // Upsert landed on a different document; follow the store.
            tracing::warn!(
                "Conversation id changed on update: requested {}, store answered {}",
                id,
                updated.id
            );
        }
        Ok(updated.id)
    }

    pub async fn fetch(&self, id: &str) -> Result<Conversation, PersistenceError> {
        self.store.fetch(id).await
    }

    /// Delete remotely and forget any save still waiting for that id.
    pub async fn remove(&mut self, id: &str) -> Result<(), PersistenceError> {
        self.store.remove(id).await?;
        self.debouncer.cancel(id);
        tracing::info!("Deleted conversation {}", id);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        self.store.list().await
    }

    pub fn schedule(&mut self, id: &str, messages: Vec<Message>, now: Instant) {
        self.debouncer.schedule(id, messages, now);
    }

    pub fn set_streaming(&mut self, streaming: bool, now: Instant) {
        self.debouncer.set_streaming(streaming, now);
    }

    pub fn cancel_pending(&mut self, id: &str) {
        self.debouncer.cancel(id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    /// Write every snapshot whose quiet period has elapsed.
    pub async fn flush_due(&mut self, now: Instant) -> Vec<SaveOutcome> {
        let due = self.debouncer.take_due(now);
        self.write_all(due).await
    }

    pub async fn flush_all(&mut self) -> Vec<SaveOutcome> {
        let pending = self.debouncer.take_all();
        self.write_all(pending).await
    }

    async fn write_all(&self, saves: Vec<PendingSave>) -> Vec<SaveOutcome> {
        let mut outcomes = Vec::with_capacity(saves.len());
        for save in saves {
            let result = self.save(&save.conversation_id, &save.messages).await;
            if let Err(e) = &result {
                tracing::warn!(
                    "Debounced save of conversation {} failed: {}",
                    save.conversation_id,
                    e
                );
            }
            outcomes.push(SaveOutcome {
                requested_id: save.conversation_id,
                result,
            });
        }
        outcomes
    }
}
