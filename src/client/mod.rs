//! Terminal chat client for the relay
//!
//! A [`ChatSession`] sends one message at a time to `POST /api/chat` and
//! feeds the reply, streamed or complete, through a [`Renderer`].

pub mod render;

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use thiserror::Error;

use crate::conversation::{ChatTurn, Role};
use crate::providers::message_content;

pub use render::{Renderer, TerminalViewport, Viewport};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("A reply is still in progress")]
    Busy,

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Relay returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Which request body the session sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// `{ "message": ... }`; the relay decides on streaming
    Message,
    /// The whole session history in the pass-through form
    History { stream: bool },
}

/// HTTP client bound to one relay
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: Url,
}

impl ChatClient {
    /// `relay_url` is the relay's base URL, e.g. `http://127.0.0.1:3000`
    pub fn new(relay_url: &str) -> Result<Self, ClientError> {
        let base = Url::parse(relay_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", relay_url, e)))?;
        let endpoint = base
            .join("/api/chat")
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", relay_url, e)))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ClientError> {
        let response = self.client.post(self.endpoint.clone()).json(body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or(text);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

/// One conversation with the relay, rendered through a [`Viewport`]
pub struct ChatSession<V: Viewport> {
    client: ChatClient,
    renderer: Renderer<V>,
    mode: RequestMode,
    model: Option<String>,
    waiting: bool,
}

impl<V: Viewport> ChatSession<V> {
    pub fn new(client: ChatClient, viewport: V, mode: RequestMode) -> Self {
        Self {
            client,
            renderer: Renderer::new(viewport),
            mode,
            model: None,
            waiting: false,
        }
    }

    /// Model requested in history mode; the relay default applies otherwise
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[cfg(test)]
    pub fn renderer(&self) -> &Renderer<V> {
        &self.renderer
    }

    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Send one user message and render the reply.
    ///
    /// Blank input is ignored. A failure before any reply text shows the
    /// fallback message; a failure part-way keeps the text received so far.
    pub async fn send(&mut self, text: &str) -> Result<(), ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if self.waiting {
            return Err(ClientError::Busy);
        }

        self.renderer.append_user_turn(text);
        self.waiting = true;
        let outcome = self.exchange(text).await;
        self.waiting = false;

        match outcome {
            Ok(()) => {
                self.renderer.finalize_assistant_turn();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat request failed");
                self.close_failed_turn();
                Err(e)
            }
        }
    }

    /// Close out a reply whose `send` future was dropped mid-flight
    pub fn abort(&mut self) {
        if self.waiting || self.renderer.surface().is_some() {
            self.close_failed_turn();
        }
        self.waiting = false;
    }

    fn close_failed_turn(&mut self) {
        let received = self
            .renderer
            .surface()
            .is_some_and(|surface| !surface.content().is_empty());
        if received {
            self.renderer.finalize_assistant_turn();
        } else {
            self.renderer.fail_assistant_turn();
        }
    }

    fn request_body(&self, text: &str) -> Value {
        match self.mode {
            RequestMode::Message => json!({ "message": text }),
            RequestMode::History { stream } => {
                // failed replies are kept locally but never sent as context
                let messages: Vec<&ChatTurn> = self
                    .renderer
                    .history()
                    .iter()
                    .filter(|turn| !(turn.role == Role::Assistant && turn.content.is_empty()))
                    .collect();
                let mut body = json!({ "messages": messages, "stream": stream });
                if let Some(ref model) = self.model {
                    body["model"] = json!(model);
                }
                body
            }
        }
    }

    async fn exchange(&mut self, text: &str) -> Result<(), ClientError> {
        let body = self.request_body(text);
        let response = self.client.post(&body).await?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let value: Value = response.json().await?;
            let content = message_content(&value).ok_or_else(|| {
                ClientError::InvalidResponse("missing choices[0].message.content".into())
            })?;
            self.renderer.begin_assistant_turn();
            self.renderer.apply_delta(content);
            return Ok(());
        }

        let mut decoder = Utf8Decoder::default();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let text = decoder.push(&chunk?);
            if !text.is_empty() {
                self.renderer.apply_delta(&text);
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            self.renderer.apply_delta(&rest);
        }
        Ok(())
    }
}

/// UTF-8 decoding that holds back a character split across chunks
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => self.finish(),
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
