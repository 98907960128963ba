use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use url::Url;

use super::models::*;
use super::traits::{ChatTransport, ChunkStream};
use super::types::{ChatError, ChatRequest, DefaultConfig, ModelInfo};
use crate::models::{Conversation, ConversationSummary, Message};
use crate::services::store::{ConversationStore, PersistenceError};

/// HTTP client for the chat API and its conversation store.
pub struct Backend {
    client: Client,
    base_url: Url,
    model: Option<String>,
    provider: Option<String>,
    list_limit: u32,
}

impl Backend {
    pub fn new(base_url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        // `Url::join` drops the last path segment unless the base ends with a slash.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)?;
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            base_url,
            model: None,
            provider: None,
            list_limit: 100,
        })
    }

    /// Model and provider recorded on new conversations.
    pub fn with_model(mut self, model: Option<String>, provider: Option<String>) -> Self {
        self.model = model;
        self.provider = provider;
        self
    }

    pub fn with_list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }

    fn conversation_url(&self, id: &str) -> Result<Url, PersistenceError> {
        let mut url = self
            .endpoint("conversations/")
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| PersistenceError::InvalidResponse("Base URL cannot hold a path".into()))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    fn parse_error_message(status: StatusCode, body: &str) -> String {
        serde_json::from_str::<ErrorResponse>(body)
            .ok()
            .and_then(ErrorResponse::into_message)
            .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()))
    }

    async fn check_store_response(
        response: reqwest::Response,
        id: Option<&str>,
    ) -> Result<reqwest::Response, PersistenceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(PersistenceError::NotFound(id.to_string()));
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(PersistenceError::Http {
            status: status.as_u16(),
            message: Self::parse_error_message(status, &body),
        })
    }

    async fn read_conversation(response: reqwest::Response) -> Result<Conversation, PersistenceError> {
        response
            .json::<Conversation>()
            .await
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))
    }

    pub async fn health(&self) -> anyhow::Result<String> {
        // The health route sits beside the API prefix, not under it.
        let path = if self.base_url.path() == "/" {
            "health"
        } else {
            "../health"
        };
        let url = self.endpoint(path)?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        let health: HealthResponse = response.json().await?;
        Ok(health.status)
    }

    pub async fn default_config(&self) -> anyhow::Result<DefaultConfig> {
        let url = self.endpoint("default-config")?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let url = self.endpoint("models")?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        let list: ModelListResponse = response.json().await?;
        Ok(list.models)
    }
}

#[async_trait]
impl ChatTransport for Backend {
    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkStream, ChatError> {
        let url = self
            .endpoint("chat")
            .map_err(|e| ChatError::Network(e.to_string()))?;

        tracing::debug!(
            "Opening chat stream at {} with {} messages",
            url,
            request.messages.len()
        );

        let response = self
            .client
            .post(url)
            .header("accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                message: Self::parse_error_message(status, &body),
            });
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| ChatError::Network(format!("Stream error: {}", e)))
            .boxed())
    }
}

#[async_trait]
impl ConversationStore for Backend {
    async fn create(&self, title: &str) -> Result<Conversation, PersistenceError> {
        let url = self
            .endpoint("conversations/")
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
        let body = CreateConversationBody {
            title,
            messages: Vec::new(),
            model: self.model.as_deref(),
            provider: self.provider.as_deref(),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PersistenceError::NetworkError(e.to_string()))?;
        let response = Self::check_store_response(response, None).await?;
        Self::read_conversation(response).await
    }

    async fn update(
        &self,
        id: &str,
        messages: &[Message],
    ) -> Result<Conversation, PersistenceError> {
        let url = self.conversation_url(id)?;
        let response = self
            .client
            .put(url)
            .json(&UpdateConversationBody { messages })
            .send()
            .await
            .map_err(|e| PersistenceError::NetworkError(e.to_string()))?;
        let response = Self::check_store_response(response, Some(id)).await?;
        Self::read_conversation(response).await
    }

    async fn fetch(&self, id: &str) -> Result<Conversation, PersistenceError> {
        let url = self.conversation_url(id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PersistenceError::NetworkError(e.to_string()))?;
        let response = Self::check_store_response(response, Some(id)).await?;
        Self::read_conversation(response).await
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        let url = self.conversation_url(id)?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| PersistenceError::NetworkError(e.to_string()))?;
        Self::check_store_response(response, Some(id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        let mut url = self
            .endpoint("conversations/")
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("skip", "0")
            .append_pair("limit", &self.list_limit.to_string());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PersistenceError::NetworkError(e.to_string()))?;
        let response = Self::check_store_response(response, None).await?;
        response
            .json::<Vec<ConversationSummary>>()
            .await
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))
    }
}
