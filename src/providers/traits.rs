use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::types::{ChatError, ChatRequest};

/// Raw response body of a streamed chat call, one item per transport chunk.
pub type ChunkStream = BoxStream<'static, Result<Bytes, ChatError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue the chat request and hand back the body once the status line is known
    /// to be a success. Non-2xx responses are reported as `ChatError::Http`.
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkStream, ChatError>;
}
