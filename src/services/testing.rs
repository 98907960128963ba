use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::models::{Conversation, ConversationSummary, Message};
use crate::providers::{ChatError, ChatRequest, ChatTransport, ChunkStream};
use crate::services::store::{ConversationStore, PersistenceError};

// --- Chat transport ---

enum Script {
    Feed(mpsc::UnboundedReceiver<Result<Bytes, ChatError>>),
    Fail(ChatError),
}

#[derive(Default)]
struct TransportInner {
    scripts: VecDeque<Script>,
    requests: Vec<ChatRequest>,
}

/// Each `open_stream` call consumes the next scripted response in order.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<TransportInner>>,
}

/// Test-side handle that writes raw body chunks into one scripted response.
pub struct Feed {
    tx: mpsc::UnboundedSender<Result<Bytes, ChatError>>,
}

impl Feed {
    pub fn send_raw(&self, chunk: &str) {
        let _ = self.tx.send(Ok(Bytes::from(chunk.to_string())));
    }

    pub fn send_delta(&self, text: &str) {
        let payload = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
        self.send_raw(&format!("data: {}\n\n", payload));
    }

    pub fn send_error(&self, message: &str) {
        let payload = serde_json::json!({ "error": message });
        self.send_raw(&format!("data: {}\n\n", payload));
    }

    pub fn send_transport_error(&self, error: ChatError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn finish(&self) {
        self.send_raw("data: [DONE]\n\n");
    }

    pub fn close(self) {}
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().scripts.push_back(Script::Feed(rx));
        Feed { tx }
    }

    pub fn push_failure(&self, error: ChatError) {
        self.inner.lock().unwrap().scripts.push_back(Script::Fail(error));
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkStream, ChatError> {
        let script = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(request);
            inner.scripts.pop_front()
        };

        match script {
            Some(Script::Feed(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Script::Fail(error)) => Err(error),
            None => Err(ChatError::Network("no scripted response".into())),
        }
    }
}

// --- Conversation store ---

/// Every call a [`MemoryStore`] has answered, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct StoreCalls {
    pub created_titles: Vec<String>,
    pub updates: Vec<(String, Vec<Message>)>,
    pub fetches: usize,
    pub removes: Vec<String>,
    pub lists: usize,
}

#[derive(Default)]
struct StoreInner {
    conversations: Vec<Conversation>,
    next_id: u64,
    calls: StoreCalls,
    fail_create: bool,
    fail_update: bool,
    fail_fetch: bool,
    fail_remove: bool,
    drift_to: Option<String>,
    listing: Option<Vec<ConversationSummary>>,
}

/// Conversation store held in memory. Each operation can be told to fail.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> StoreCalls {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Seed a record whose `updated_at` lies `age_minutes` in the past.
    pub fn insert(&self, id: &str, title: &str, messages: Vec<Message>, age_minutes: i64) {
        let ts = Utc::now() - Duration::minutes(age_minutes);
        self.inner.lock().unwrap().conversations.push(Conversation {
            id: id.to_string(),
            title: title.to_string(),
            messages,
            created_at: Some(ts),
            updated_at: Some(ts),
            model: None,
            provider: None,
        });
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        let inner = self.inner.lock().unwrap();
        inner.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.inner.lock().unwrap().fail_update = fail;
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.inner.lock().unwrap().fail_fetch = fail;
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.inner.lock().unwrap().fail_remove = fail;
    }

    /// Make every update land on (and answer with) a different id.
    pub fn set_drift_to(&self, id: Option<&str>) {
        self.inner.lock().unwrap().drift_to = id.map(str::to_string);
    }

    /// Answer `list()` with exactly these rows.
    pub fn set_listing(&self, rows: Vec<ConversationSummary>) {
        self.inner.lock().unwrap().listing = Some(rows);
    }

    fn unavailable() -> PersistenceError {
        PersistenceError::Http {
            status: 500,
            message: "store unavailable".into(),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, title: &str) -> Result<Conversation, PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.created_titles.push(title.to_string());
        if inner.fail_create {
            return Err(Self::unavailable());
        }

        inner.next_id += 1;
        let now = Utc::now();
        let conv = Conversation {
            id: format!("conv-{}", inner.next_id),
            title: title.to_string(),
            messages: Vec::new(),
            created_at: Some(now),
            updated_at: Some(now),
            model: None,
            provider: None,
        };
        inner.conversations.push(conv.clone());
        Ok(conv)
    }

    async fn update(
        &self,
        id: &str,
        messages: &[Message],
    ) -> Result<Conversation, PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.updates.push((id.to_string(), messages.to_vec()));
        if inner.fail_update {
            return Err(Self::unavailable());
        }

        let target = inner.drift_to.clone().unwrap_or_else(|| id.to_string());
        let title = inner
            .conversations
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.title.clone())
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;

        let now = Utc::now();
        match inner.conversations.iter_mut().find(|c| c.id == target) {
            Some(conv) => {
                conv.messages = messages.to_vec();
                conv.updated_at = Some(now);
                Ok(conv.clone())
            }
            None => {
                let conv = Conversation {
                    id: target,
                    title,
                    messages: messages.to_vec(),
                    created_at: Some(now),
                    updated_at: Some(now),
                    model: None,
                    provider: None,
                };
                inner.conversations.push(conv.clone());
                Ok(conv)
            }
        }
    }

    async fn fetch(&self, id: &str) -> Result<Conversation, PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.fetches += 1;
        if inner.fail_fetch {
            return Err(Self::unavailable());
        }
        inner
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.removes.push(id.to_string());
        if inner.fail_remove {
            return Err(Self::unavailable());
        }
        let before = inner.conversations.len();
        inner.conversations.retain(|c| c.id != id);
        if inner.conversations.len() == before {
            return Err(PersistenceError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.lists += 1;
        if let Some(rows) = &inner.listing {
            return Ok(rows.clone());
        }
        Ok(inner
            .conversations
            .iter()
            .map(ConversationSummary::from)
            .collect())
    }
}

// --- Logs ---

/// Collects formatted log lines written while its guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's `tracing` output here until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
