use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Message, Role};
use crate::providers::stream::decode_stream;
use crate::providers::{ChatError, ChatRequest, ChatTransport, StreamEvent};

/// Request options that do not change between messages.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Reported by a streaming task back to the owner of the message log.
/// `generation` identifies the session that produced it.
#[derive(Debug)]
pub enum SessionEvent {
    Event {
        generation: u64,
        event: StreamEvent,
    },
    Finished {
        generation: u64,
        outcome: Result<(), ChatError>,
    },
}

impl SessionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SessionEvent::Event { generation, .. } | SessionEvent::Finished { generation, .. } => {
                *generation
            }
        }
    }
}

/// Build a streamed `ChatRequest` from the conversation history.
pub fn build_request(history: Vec<Message>, options: &ChatOptions) -> ChatRequest {
    ChatRequest {
        messages: history,
        stream: true,
        model: options.model.clone(),
        provider: options.provider.clone(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

/// Apply one event to the tail of the message log.
///
/// Returns the appended text, `None` when nothing changed, or `ChatError::Stream`
/// when the server reported an error.
pub fn apply_event(
    messages: &mut [Message],
    event: &StreamEvent,
) -> Result<Option<String>, ChatError> {
    if let Some(error) = &event.error {
        return Err(ChatError::Stream(error.clone()));
    }

    let Some(delta) = &event.delta_content else {
        return Ok(None);
    };

    match messages.last_mut() {
        Some(last) if last.role == Role::Assistant => {
            last.content.push_str(delta);
            Ok(Some(delta.clone()))
        }
        _ => {
            tracing::warn!("Dropping stream delta: log does not end with an assistant message");
            Ok(None)
        }
    }
}

/// Run one stream session to completion, forwarding every decoded event.
///
/// Always finishes with exactly one `SessionEvent::Finished`, unless the receiver
/// is gone. Cancellation is reported as `ChatError::Aborted`.
pub async fn run_streaming(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    cancel_token: CancellationToken,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let outcome = async {
        let chunks = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(ChatError::Aborted),
            opened = transport.open_stream(request) => opened?,
        };

        let mut events = decode_stream(chunks, cancel_token.clone());
        while let Some(event) = events.next().await {
            let event = event?;
            if tx.send(SessionEvent::Event { generation, event }).is_err() {
                // receiver dropped
                cancel_token.cancel();
                return Err(ChatError::Aborted);
            }
        }
        Ok::<(), ChatError>(())
    }
    .await;

    match &outcome {
        Ok(()) => tracing::debug!("Stream session {} completed", generation),
        Err(ChatError::Aborted) => tracing::debug!("Stream session {} aborted", generation),
        Err(e) => tracing::warn!("Stream session {} failed: {}", generation, e),
    }

    let _ = tx.send(SessionEvent::Finished {
        generation,
        outcome,
    });
}
