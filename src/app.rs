use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{Message, Role};
use crate::providers::types::STREAM_FAILED_MESSAGE;
use crate::providers::{ChatError, ChatTransport};
use crate::services::chat::{self, ChatOptions, SessionEvent};
use crate::services::conversation::truncate_title;
use crate::services::sync::SaveOutcome;
use crate::services::{ConversationStore, PersistenceSync};

pub const LOAD_FAILED_MESSAGE: &str = "Failed to load conversation";
pub const CREATE_FAILED_MESSAGE: &str = "Failed to create conversation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Request sent, no content yet.
    AwaitingFirstByte,
    Streaming,
    Error,
}

/// Everything the UI renders. Only `App` mutates it.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub phase: Phase,
    pub error: Option<String>,
}

impl ChatState {
    pub fn is_loading(&self) -> bool {
        self.phase == Phase::AwaitingFirstByte
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::AwaitingFirstByte | Phase::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input.
    Ignored,
    /// A stream was active; it was stopped instead of sending.
    Stopped,
    Started,
    /// The conversation could not be created.
    Blocked,
}

/// What a session event changed, for the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppUpdate {
    Ignored,
    Delta(String),
    Completed,
    Aborted,
    Failed(String),
}

struct StreamSession {
    generation: u64,
    cancel_token: CancellationToken,
}

/// Owns the message log and the single in-flight stream session.
pub struct App {
    transport: Arc<dyn ChatTransport>,
    sync: PersistenceSync,
    options: ChatOptions,
    state: ChatState,
    session: Option<StreamSession>,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    list_revision: u64,
}

impl App {
    /// The receiver carries events from streaming tasks; feed each one back
    /// through [`App::handle_session_event`].
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn ConversationStore>,
        options: ChatOptions,
        save_debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let app = Self {
            transport,
            sync: PersistenceSync::new(store, save_debounce),
            options,
            state: ChatState::default(),
            session: None,
            generation: 0,
            events,
            list_revision: 0,
        };
        (app, rx)
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn sync(&self) -> &PersistenceSync {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut PersistenceSync {
        &mut self.sync
    }

    /// Changes whenever the conversation list may be stale.
    pub fn list_revision(&self) -> u64 {
        self.list_revision
    }

    pub async fn send_message(&mut self, content: &str) -> SendOutcome {
        if content.trim().is_empty() {
            return SendOutcome::Ignored;
        }

        if self.state.is_streaming() {
            self.stop_streaming();
            return SendOutcome::Stopped;
        }

        self.state.error = None;

        let conversation_id = match self.state.conversation_id.clone() {
            Some(id) => id,
            None => {
                let title = truncate_title(content);
                match self.sync.create(&title).await {
                    Ok(conv) => {
                        self.state.conversation_id = Some(conv.id.clone());
                        self.state.title = Some(conv.title);
                        self.list_revision += 1;
                        conv.id
                    }
                    Err(e) => {
                        tracing::error!("Failed to create conversation: {}", e);
                        self.state.error = Some(CREATE_FAILED_MESSAGE.to_string());
                        self.state.phase = Phase::Error;
                        return SendOutcome::Blocked;
                    }
                }
            }
        };

        self.state.messages.push(Message::user(content));
        self.persist_now(&conversation_id).await;

        let history = self.state.messages.clone();
        self.state.messages.push(Message::placeholder());
        self.begin_session(history);

        SendOutcome::Started
    }

    /// Cancel the active session, keeping whatever content already arrived.
    /// Returns `false` when nothing was streaming.
    pub fn stop_streaming(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        tracing::info!("Stopping stream session {}", session.generation);
        session.cancel_token.cancel();
        self.state.phase = Phase::Idle;
        self.sync.set_streaming(false, Instant::now());
        self.schedule_save();
        true
    }

    pub fn clear_messages(&mut self) {
        self.cancel_session();
        self.state = ChatState::default();
    }

    pub async fn load_conversation(&mut self, id: &str) {
        self.cancel_session();

        match self.sync.fetch(id).await {
            Ok(conv) => {
                tracing::info!(
                    "Loaded conversation {} with {} messages",
                    conv.id,
                    conv.messages.len()
                );
                self.state = ChatState {
                    messages: conv.messages,
                    conversation_id: Some(conv.id),
                    title: Some(conv.title),
                    phase: Phase::Idle,
                    error: None,
                };
            }
            Err(e) => {
                tracing::error!("Failed to load conversation {}: {}", id, e);
                self.state.phase = Phase::Error;
                self.state.error = Some(LOAD_FAILED_MESSAGE.to_string());
            }
        }
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) -> AppUpdate {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(event.generation()) {
            tracing::debug!(
                "Dropping event from stale stream session {}",
                event.generation()
            );
            return AppUpdate::Ignored;
        }

        match event {
            SessionEvent::Event { event, .. } => {
                match chat::apply_event(&mut self.state.messages, &event) {
                    Ok(Some(delta)) => {
                        self.state.phase = Phase::Streaming;
                        AppUpdate::Delta(delta)
                    }
                    Ok(None) => AppUpdate::Ignored,
                    Err(e) => self.fail_session(e),
                }
            }
            SessionEvent::Finished { outcome, .. } => match outcome {
                Ok(()) => {
                    self.session = None;
                    self.state.phase = Phase::Idle;
                    self.sync.set_streaming(false, Instant::now());
                    if let Some(id) = self.state.conversation_id.clone() {
                        self.persist_now(&id).await;
                        self.list_revision += 1;
                    }
                    AppUpdate::Completed
                }
                Err(ChatError::Aborted) => {
                    self.session = None;
                    self.state.phase = Phase::Idle;
                    self.sync.set_streaming(false, Instant::now());
                    self.schedule_save();
                    AppUpdate::Aborted
                }
                Err(e) => self.fail_session(e),
            },
        }
    }

    /// When the next debounced save is due, if any may run now.
    pub fn next_save_deadline(&self) -> Option<Instant> {
        self.sync.next_deadline()
    }

    pub async fn flush_due_saves(&mut self, now: Instant) {
        let outcomes = self.sync.flush_due(now).await;
        self.apply_save_outcomes(outcomes);
    }

    /// Stop streaming and write every pending save immediately.
    pub async fn shutdown(&mut self) {
        self.stop_streaming();
        let outcomes = self.sync.flush_all().await;
        self.apply_save_outcomes(outcomes);
    }

    fn begin_session(&mut self, history: Vec<Message>) {
        // At most one session: a new one always supersedes the previous.
        self.cancel_session();

        self.generation += 1;
        let generation = self.generation;
        let cancel_token = CancellationToken::new();

        self.state.phase = Phase::AwaitingFirstByte;
        self.sync.set_streaming(true, Instant::now());

        let request = chat::build_request(history, &self.options);
        tokio::spawn(chat::run_streaming(
            self.transport.clone(),
            request,
            cancel_token.clone(),
            generation,
            self.events.clone(),
        ));

        tracing::debug!("Started stream session {}", generation);
        self.session = Some(StreamSession {
            generation,
            cancel_token,
        });
    }

    fn cancel_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel_token.cancel();
        }
        if self.state.is_streaming() {
            self.state.phase = Phase::Idle;
        }
        self.sync.set_streaming(false, Instant::now());
    }

    fn fail_session(&mut self, error: ChatError) -> AppUpdate {
        tracing::error!("Stream failed: {}", error);
        if let Some(session) = self.session.take() {
            session.cancel_token.cancel();
        }
        self.sync.set_streaming(false, Instant::now());

        let discard_partial = matches!(error, ChatError::Stream(_));
        let strip = self.state.messages.last().is_some_and(|last| {
            last.is_empty_assistant() || (discard_partial && last.role == Role::Assistant)
        });
        if strip {
            self.state.messages.pop();
        } else {
            // Partial content survived; keep the store in step with it.
            self.schedule_save();
        }

        let message = error
            .user_message()
            .unwrap_or_else(|| STREAM_FAILED_MESSAGE.to_string());
        self.state.phase = Phase::Error;
        self.state.error = Some(message.clone());
        AppUpdate::Failed(message)
    }

    /// Best-effort immediate write; failure is logged and the flow continues.
    async fn persist_now(&mut self, id: &str) {
        match self.sync.save(id, &self.state.messages).await {
            Ok(authoritative) => {
                self.sync.cancel_pending(id);
                self.adopt_id(id, authoritative);
            }
            Err(e) => tracing::warn!("Failed to save conversation {}: {}", id, e),
        }
    }

    fn schedule_save(&mut self) {
        if let Some(id) = &self.state.conversation_id {
            self.sync
                .schedule(id, self.state.messages.clone(), Instant::now());
        }
    }

    fn apply_save_outcomes(&mut self, outcomes: Vec<SaveOutcome>) {
        for outcome in outcomes {
            if let Ok(authoritative) = outcome.result {
                self.adopt_id(&outcome.requested_id, authoritative);
            }
        }
    }

    fn adopt_id(&mut self, requested: &str, authoritative: String) {
        if requested == authoritative {
            return;
        }
        if self.state.conversation_id.as_deref() == Some(requested) {
            self.state.conversation_id = Some(authoritative);
            self.list_revision += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{LogCapture, MemoryStore, ScriptedTransport};

    const DEBOUNCE: Duration = Duration::from_millis(1000);

    struct Harness {
        app: App,
        rx: mpsc::UnboundedReceiver<SessionEvent>,
        transport: ScriptedTransport,
        store: MemoryStore,
    }

    fn harness() -> Harness {
        let transport = ScriptedTransport::new();
        let store = MemoryStore::new();
        let (app, rx) = App::new(
            Arc::new(transport.clone()),
            Arc::new(store.clone()),
            ChatOptions::default(),
            DEBOUNCE,
        );
        Harness {
            app,
            rx,
            transport,
            store,
        }
    }

    impl Harness {
        /// Apply events until the current session settles.
        async fn run_session(&mut self) -> Vec<AppUpdate> {
            let mut updates = Vec::new();
            while let Some(event) = self.rx.recv().await {
                let update = self.app.handle_session_event(event).await;
                let settled = matches!(
                    update,
                    AppUpdate::Completed | AppUpdate::Aborted | AppUpdate::Failed(_)
                );
                updates.push(update);
                if settled {
                    break;
                }
            }
            updates
        }
    }

    #[tokio::test]
    async fn test_send_hello_creates_conversation_and_streams() {
        let mut h = harness();
        let feed = h.transport.push_session();

        assert_eq!(h.app.send_message("Hello").await, SendOutcome::Started);

        assert_eq!(h.store.calls().created_titles, vec!["Hello".to_string()]);
        assert_eq!(
            h.app.state().messages,
            vec![Message::user("Hello"), Message::assistant("")]
        );
        assert!(h.app.state().is_streaming());
        assert!(h.app.state().is_loading());

        feed.send_delta("Hi");
        let update = h.app.handle_session_event(h.rx.recv().await.unwrap()).await;
        assert_eq!(update, AppUpdate::Delta("Hi".into()));
        assert_eq!(h.app.state().phase, Phase::Streaming);
        assert!(!h.app.state().is_loading());
        assert_eq!(h.app.state().messages[0], Message::user("Hello"));

        feed.send_delta(" there");
        feed.finish();
        feed.close();
        let updates = h.run_session().await;
        assert_eq!(updates.last(), Some(&AppUpdate::Completed));

        let state = h.app.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1], Message::assistant("Hi there"));
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.title.as_deref(), Some("Hello"));

        // History sent excludes the placeholder.
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages, vec![Message::user("Hello")]);

        // Final write matches the log.
        let id = state.conversation_id.clone().unwrap();
        assert_eq!(h.store.get(&id).unwrap().messages, state.messages);
    }

    #[tokio::test]
    async fn test_long_first_message_is_truncated_for_title() {
        let mut h = harness();
        let _feed = h.transport.push_session();
        h.app
            .send_message("Explain how tokio schedules tasks across worker threads")
            .await;
        assert_eq!(
            h.store.calls().created_titles,
            vec!["Explain how tokio schedules ta...".to_string()]
        );
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let mut h = harness();
        assert_eq!(h.app.send_message("   \n\t").await, SendOutcome::Ignored);
        assert!(h.store.calls().created_titles.is_empty());
        assert_eq!(h.transport.request_count(), 0);
        assert!(h.app.state().messages.is_empty());
    }

    #[tokio::test]
    async fn test_send_while_streaming_only_stops() {
        let mut h = harness();
        let _feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        assert!(h.app.state().is_streaming());

        assert_eq!(h.app.send_message("Another").await, SendOutcome::Stopped);
        assert_eq!(h.transport.request_count(), 1);
        assert!(!h.app.state().is_streaming());
        assert_eq!(h.app.state().messages.len(), 2);
        assert!(h.app.state().error.is_none());
    }

    #[tokio::test]
    async fn test_no_deltas_applied_after_stop() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;

        feed.send_delta("a");
        let update = h.app.handle_session_event(h.rx.recv().await.unwrap()).await;
        assert_eq!(update, AppUpdate::Delta("a".into()));

        assert!(h.app.stop_streaming());
        assert!(!h.app.stop_streaming());

        feed.send_delta("b");
        feed.finish();
        feed.close();
        while let Some(event) = h.rx.recv().await {
            let finished = matches!(event, SessionEvent::Finished { .. });
            assert_eq!(h.app.handle_session_event(event).await, AppUpdate::Ignored);
            if finished {
                break;
            }
        }

        assert_eq!(h.app.state().messages[1], Message::assistant("a"));
        assert_eq!(h.app.state().phase, Phase::Idle);
        assert!(h.app.state().error.is_none());
    }

    #[tokio::test]
    async fn test_clear_messages_resets_everything() {
        let mut h = harness();
        let _feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        h.app.clear_messages();

        let state = h.app.state();
        assert!(state.messages.is_empty());
        assert!(state.conversation_id.is_none());
        assert!(state.title.is_none());
        assert!(state.error.is_none());
        assert!(!state.is_streaming());

        // Also from an error state.
        h.store.set_fail_fetch(true);
        h.app.load_conversation("missing").await;
        assert!(h.app.state().error.is_some());
        h.app.clear_messages();
        assert!(h.app.state().error.is_none());
        assert_eq!(h.app.state().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_stream_error_discards_assistant_message() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;

        feed.send_delta("par");
        feed.send_error("Test streaming error");
        let updates = h.run_session().await;

        assert_eq!(
            updates.last(),
            Some(&AppUpdate::Failed(STREAM_FAILED_MESSAGE.to_string()))
        );
        let state = h.app.state();
        assert_eq!(state.messages, vec![Message::user("Hello")]);
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error.as_deref(), Some(STREAM_FAILED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_keeps_partial_and_schedules_save() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        let id = h.app.state().conversation_id.clone().unwrap();
        let logs = LogCapture::default();
        let _guard = logs.install();

        feed.send_delta("Partial");
        feed.send_transport_error(ChatError::Network("connection reset".into()));
        let updates = h.run_session().await;

        assert_eq!(
            updates.last(),
            Some(&AppUpdate::Failed(STREAM_FAILED_MESSAGE.to_string()))
        );
        let state = h.app.state();
        assert_eq!(
            state.messages,
            vec![Message::user("Hello"), Message::assistant("Partial")]
        );
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error.as_deref(), Some(STREAM_FAILED_MESSAGE));
        assert!(logs
            .contents()
            .contains("Stream failed: Network error: connection reset"));

        let deadline = h.app.next_save_deadline();
        assert!(deadline.is_some());
        tokio::time::sleep_until(deadline.unwrap()).await;
        h.app.flush_due_saves(Instant::now()).await;
        assert_eq!(
            h.store.get(&id).unwrap().messages,
            vec![Message::user("Hello"), Message::assistant("Partial")]
        );
    }

    #[tokio::test]
    async fn test_parse_error_strips_empty_placeholder() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;

        feed.send_raw("data: {not json\n\n");
        let updates = h.run_session().await;

        assert_eq!(
            updates.last(),
            Some(&AppUpdate::Failed(STREAM_FAILED_MESSAGE.to_string()))
        );
        assert_eq!(h.app.state().messages, vec![Message::user("Hello")]);
    }

    #[tokio::test]
    async fn test_parse_error_keeps_partial_content() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;

        feed.send_delta("Partial");
        feed.send_raw("data: oops\n\n");
        h.run_session().await;

        assert_eq!(
            h.app.state().messages,
            vec![Message::user("Hello"), Message::assistant("Partial")]
        );
        assert_eq!(h.app.state().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_http_failure_shows_server_message() {
        let mut h = harness();
        h.transport.push_failure(ChatError::Http {
            status: 429,
            message: "Rate limit reached".into(),
        });
        h.app.send_message("Hello").await;

        let updates = h.run_session().await;
        assert_eq!(
            updates,
            vec![AppUpdate::Failed("Rate limit reached".to_string())]
        );
        assert_eq!(h.app.state().messages, vec![Message::user("Hello")]);
    }

    #[tokio::test]
    async fn test_create_failure_blocks_send() {
        let mut h = harness();
        h.store.set_fail_create(true);

        assert_eq!(h.app.send_message("Hello").await, SendOutcome::Blocked);
        assert_eq!(h.transport.request_count(), 0);
        assert!(h.app.state().messages.is_empty());
        assert_eq!(h.app.state().error.as_deref(), Some(CREATE_FAILED_MESSAGE));
    }

    #[tokio::test]
    async fn test_update_failure_is_not_fatal() {
        let mut h = harness();
        h.store.set_fail_update(true);
        let feed = h.transport.push_session();

        assert_eq!(h.app.send_message("Hello").await, SendOutcome::Started);
        feed.send_delta("ok");
        feed.close();
        let updates = h.run_session().await;
        assert_eq!(updates.last(), Some(&AppUpdate::Completed));
        assert!(h.app.state().error.is_none());
    }

    #[tokio::test]
    async fn test_second_message_reuses_conversation() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        feed.send_delta("Hi");
        feed.close();
        h.run_session().await;

        let feed = h.transport.push_session();
        h.app.send_message("How are you?").await;
        feed.send_delta("Fine");
        feed.close();
        h.run_session().await;

        assert_eq!(h.store.calls().created_titles.len(), 1);
        assert_eq!(
            h.transport.requests()[1].messages,
            vec![
                Message::user("Hello"),
                Message::assistant("Hi"),
                Message::user("How are you?")
            ]
        );
        assert_eq!(h.app.state().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_id_drift_is_adopted() {
        let mut h = harness();
        h.store.set_drift_to(Some("conv-drifted"));
        let _feed = h.transport.push_session();
        let logs = LogCapture::default();
        let _guard = logs.install();

        let before = h.app.list_revision();
        h.app.send_message("Hello").await;

        assert_eq!(h.app.state().conversation_id.as_deref(), Some("conv-drifted"));
        assert!(h.app.list_revision() >= before + 2);
        let logged = logs.contents();
        assert!(logged.contains("WARN"), "{}", logged);
        assert!(logged.contains("Conversation id changed on update"));
        assert!(logged.contains("store answered conv-drifted"));
    }

    #[tokio::test]
    async fn test_load_conversation_replaces_state() {
        let mut h = harness();
        h.store.insert(
            "conv-9",
            "Earlier chat",
            vec![Message::user("Q"), Message::assistant("A")],
            5,
        );
        let _feed = h.transport.push_session();
        h.app.send_message("Hello").await;

        h.app.load_conversation("conv-9").await;
        let state = h.app.state();
        assert!(!state.is_streaming());
        assert_eq!(state.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(state.title.as_deref(), Some("Earlier chat"));
        assert_eq!(
            state.messages,
            vec![Message::user("Q"), Message::assistant("A")]
        );
        assert_eq!(h.store.calls().fetches, 1);
    }

    #[tokio::test]
    async fn test_load_failure_sets_fixed_message() {
        let mut h = harness();
        h.app.load_conversation("nope").await;
        assert_eq!(h.app.state().error.as_deref(), Some(LOAD_FAILED_MESSAGE));
        assert_eq!(h.app.state().phase, Phase::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_content_saved_after_quiet_period() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        let id = h.app.state().conversation_id.clone().unwrap();

        feed.send_delta("Half an ans");
        h.app.handle_session_event(h.rx.recv().await.unwrap()).await;
        assert_eq!(h.app.next_save_deadline(), None);

        h.app.stop_streaming();
        let deadline = h.app.next_save_deadline().expect("save scheduled");

        h.app.flush_due_saves(Instant::now()).await;
        assert_eq!(
            h.store.get(&id).unwrap().messages,
            vec![Message::user("Hello")]
        );

        tokio::time::sleep_until(deadline).await;
        h.app.flush_due_saves(Instant::now()).await;
        assert_eq!(
            h.store.get(&id).unwrap().messages,
            vec![Message::user("Hello"), Message::assistant("Half an ans")]
        );
        assert_eq!(h.app.next_save_deadline(), None);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_saves() {
        let mut h = harness();
        let feed = h.transport.push_session();
        h.app.send_message("Hello").await;
        let id = h.app.state().conversation_id.clone().unwrap();

        feed.send_delta("Bye");
        h.app.handle_session_event(h.rx.recv().await.unwrap()).await;

        h.app.shutdown().await;
        assert_eq!(
            h.store.get(&id).unwrap().messages,
            vec![Message::user("Hello"), Message::assistant("Bye")]
        );
    }
}
