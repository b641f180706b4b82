//! OpenAI-compatible completion client
//!
//! Works with any API that implements the OpenAI chat completions format
//! (OpenAI, DeepSeek, Groq, vLLM, LM Studio, ...). The configured URL is the
//! full `chat/completions` endpoint.

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::UpstreamSettings;
use crate::conversation::{ChatTurn, Role};

use super::stream::{decode_events, StreamEvent};
use super::ProviderError;

/// Message as sent upstream; only role and content leave the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatTurn> for UpstreamMessage {
    fn from(turn: &ChatTurn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Chat completion request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Extract `choices[0].message.content` from a non-streaming response
pub fn message_content(response: &Value) -> Option<&str> {
    response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Owned stream of decoded upstream events
pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Client for one configured upstream endpoint
pub struct UpstreamClient {
    settings: UpstreamSettings,
    client: Client,
}

impl UpstreamClient {
    pub fn new(settings: UpstreamSettings) -> Result<Self, ProviderError> {
        // Streamed bodies get no overall deadline; non-streaming calls set one
        // per request in `send`.
        let client = Client::builder()
            .connect_timeout(settings.timeout)
            .build()?;

        Ok(Self { settings, client })
    }

    pub fn endpoint(&self) -> &str {
        self.settings.url.as_str()
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let mut req_builder = self
            .client
            .post(self.settings.url.clone())
            .bearer_auth(&self.settings.api_key)
            .json(request);

        if !request.stream {
            req_builder = req_builder.timeout(self.settings.timeout);
        }

        let response = req_builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        Ok(response)
    }

    /// Send a non-streaming request and return the upstream JSON as-is
    pub async fn complete(&self, request: &CompletionRequest) -> Result<Value, ProviderError> {
        let response = self.send(request).await?;
        let body = response.text().await?;

        serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
        })
    }

    /// Send a streaming request.
    ///
    /// Resolves once the upstream has answered with a success status, so HTTP
    /// errors surface before any event is produced.
    pub async fn open_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<EventStream, ProviderError> {
        let response = self.send(request).await?;
        Ok(decode_events(response.bytes_stream())
            .map(|item| item.map_err(ProviderError::from))
            .boxed())
    }
}
