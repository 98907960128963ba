use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::models::StreamPayload;
use super::traits::ChunkStream;
use super::types::{ChatError, StreamEvent};

/// Terminal sentinel payload; never emitted as an event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental decoder for `data: <json>\n\n` records.
///
/// Chunk boundaries are arbitrary: a record, a line, or a multi-byte character
/// may be split across any number of `push` calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk and return the events of every record it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, ChatError> {
        self.byte_buf.extend_from_slice(bytes);
        self.decode_utf8();

        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let record: String = self.buffer.drain(..event_end + 2).collect();
            if let Some(event) = parse_record(&record[..event_end])? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush whatever is left once the body has ended. A trailing record without
    /// its blank line still counts; anything unparsable is dropped.
    pub fn finish(mut self) -> Option<StreamEvent> {
        if !self.byte_buf.is_empty() {
            let rest = String::from_utf8_lossy(&self.byte_buf).into_owned();
            self.byte_buf.clear();
            self.append_normalized(&rest);
        }

        if self.buffer.trim().is_empty() {
            return None;
        }

        match parse_record(&self.buffer) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Discarding unparsable trailing stream data: {}", e);
                None
            }
        }
    }

    // Decode as much valid UTF-8 as possible, holding back an incomplete tail.
    fn decode_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.byte_buf) {
                Ok(s) => {
                    let decoded = s.to_string();
                    self.byte_buf.clear();
                    self.append_normalized(&decoded);
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    let decoded = String::from_utf8_lossy(&self.byte_buf[..valid_up_to]).into_owned();
                    match e.error_len() {
                        // Truncated sequence at the end: wait for the next chunk.
                        None => {
                            self.byte_buf.drain(..valid_up_to);
                            self.append_normalized(&decoded);
                            return;
                        }
                        // Genuinely invalid bytes: replace and keep going.
                        Some(len) => {
                            self.byte_buf.drain(..valid_up_to + len);
                            self.append_normalized(&decoded);
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                        }
                    }
                }
            }
        }
    }

    // Only the new text and the join with the previous chunk are scanned.
    fn append_normalized(&mut self, text: &str) {
        // A CR may arrive at the end of one chunk and its LF at the start of the next.
        if text.starts_with('\n') && self.buffer.ends_with('\r') {
            self.buffer.pop();
        }
        if text.contains("\r\n") {
            self.buffer.push_str(&text.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(text);
        }
    }
}

/// Parse one record (without its terminating blank line).
fn parse_record(record: &str) -> Result<Option<StreamEvent>, ChatError> {
    let mut data_lines = Vec::new();
    for line in record.lines() {
        if let Some(payload) = line.strip_prefix("data:") {
            data_lines.push(payload.strip_prefix(' ').unwrap_or(payload));
        }
    }

    if data_lines.is_empty() {
        return Ok(None);
    }

    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return Ok(None);
    }

    let parsed: StreamPayload =
        serde_json::from_str(payload).map_err(|e| ChatError::Parse(e.to_string()))?;
    Ok(Some(parsed.into()))
}

enum Read {
    Cancelled,
    Chunk(Option<Result<Bytes, ChatError>>),
}

struct DecodeState {
    chunks: ChunkStream,
    decoder: Option<FrameDecoder>,
    ready: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

/// Turn a response body into a lazy sequence of events.
///
/// The token is checked before every read and before every buffered event is
/// handed out; once it fires the sequence yields `ChatError::Aborted` and ends.
/// Parse and transport errors also end the sequence after being yielded.
pub fn decode_stream(
    chunks: ChunkStream,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<StreamEvent, ChatError>> {
    let state = DecodeState {
        chunks,
        decoder: Some(FrameDecoder::new()),
        ready: VecDeque::new(),
        cancel,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished && state.ready.is_empty() {
                return None;
            }

            if state.cancel.is_cancelled() {
                state.ready.clear();
                state.finished = true;
                state.decoder = None;
                return Some((Err(ChatError::Aborted), state));
            }

            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }

            let read = {
                let cancel = state.cancel.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Read::Cancelled,
                    next = state.chunks.next() => Read::Chunk(next),
                }
            };

            match read {
                // Reported at the top of the loop.
                Read::Cancelled => continue,
                Read::Chunk(Some(Ok(bytes))) => {
                    let Some(decoder) = state.decoder.as_mut() else {
                        state.finished = true;
                        continue;
                    };
                    match decoder.push(&bytes) {
                        Ok(events) => state.ready.extend(events),
                        Err(e) => {
                            state.finished = true;
                            state.ready.clear();
                            return Some((Err(e), state));
                        }
                    }
                }
                Read::Chunk(Some(Err(e))) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(e), state));
                }
                Read::Chunk(None) => {
                    state.finished = true;
                    if let Some(event) = state.decoder.take().and_then(FrameDecoder::finish) {
                        state.ready.push_back(event);
                    }
                }
            }
        }
    })
    .boxed()
}
