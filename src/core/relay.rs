//! Chat relay engine
//!
//! The relay turns an inbound chat request into one upstream completion call.
//! Non-streaming calls return the upstream JSON untouched. Streaming calls
//! hand back a channel of text deltas fed by a producer task:
//! 1. The upstream request is sent and its status checked
//! 2. A task reads decoded events and forwards each delta as soon as it arrives
//! 3. The task stops when the sentinel arrives, the upstream closes or fails,
//!    or the receiving side goes away
//! 4. A completed exchange is written to the transcript store, if one is set
//!
//! Recorded transcripts are read back through the same relay.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{Config, ConfigError, RelayProfile};
use crate::conversation::{ChatTurn, ConversationHistory, Role};
use crate::providers::{
    message_content, CompletionRequest, EventStream, ProviderError, StreamEvent, UpstreamClient,
    UpstreamMessage,
};

use super::transcript::{StoredTurn, TranscriptStore};

/// Deltas buffered between the upstream reader and the client body
const DELTA_CHANNEL_CAPACITY: usize = 32;

/// Inbound chat request, in either accepted shape
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatRequest {
    /// Full pass-through form carrying the whole history
    Completion(CompletionForm),
    /// Single-turn convenience form
    Message(MessageForm),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionForm {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: ConversationHistory,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageForm {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// What the relay hands back to the HTTP layer
#[derive(Debug)]
pub enum RelayReply {
    /// Upstream JSON response, mirrored verbatim
    Complete { conversation_id: String, body: Value },
    /// Ordered text deltas; the channel closes when the stream ends
    Streaming {
        conversation_id: String,
        deltas: mpsc::Receiver<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    ConfigurationMissing(#[from] ConfigError),

    #[error("Upstream returned HTTP {status}: {message}")]
    UpstreamHttp {
        status: u16,
        message: String,
        body: String,
    },

    #[error("Upstream response could not be parsed: {0}")]
    UpstreamParse(String),

    #[error("Upstream request failed: {0}")]
    Transport(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transcripts are not enabled (set MOXIE_DATA_DIR)")]
    TranscriptsDisabled,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Transcript store failed: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Http {
                status,
                message,
                body,
            } => RelayError::UpstreamHttp {
                status: status.as_u16(),
                message,
                body,
            },
            ProviderError::RequestFailed(e) => RelayError::Transport(e.to_string()),
            ProviderError::InvalidResponse(msg) => RelayError::UpstreamParse(msg),
        }
    }
}

/// A request resolved against the profile defaults
#[derive(Debug, Clone, PartialEq)]
struct PreparedRequest {
    conversation_id: String,
    completion: CompletionRequest,
    /// The newest user turn, recorded once the exchange succeeds
    user_turn: Option<ChatTurn>,
}

pub struct Relay {
    upstream: Result<UpstreamClient, ConfigError>,
    profile: RelayProfile,
    transcripts: Option<Arc<TranscriptStore>>,
}

impl Relay {
    /// Build the relay from the startup configuration.
    ///
    /// Missing upstream settings do not fail construction; chat requests are
    /// refused with the configuration error instead.
    pub fn new(
        config: &Config,
        transcripts: Option<Arc<TranscriptStore>>,
    ) -> Result<Self, ProviderError> {
        let upstream = match config.upstream() {
            Ok(settings) => {
                let client = UpstreamClient::new(settings)?;
                tracing::info!("🔗 Relaying chat to {}", client.endpoint());
                Ok(client)
            }
            Err(e) => {
                tracing::warn!("⚠️ Chat relay disabled: {}", e);
                Err(e)
            }
        };

        Ok(Self {
            upstream,
            profile: config.profile.clone(),
            transcripts,
        })
    }

    /// Whether chat requests can currently be served
    pub fn is_configured(&self) -> bool {
        self.upstream.is_ok()
    }

    /// Recorded conversation ids, most recently updated first
    pub async fn conversations(&self) -> Result<Vec<String>, RelayError> {
        let store = self.transcripts.as_deref().ok_or(RelayError::TranscriptsDisabled)?;
        Ok(store.list_conversations().await?)
    }

    /// Every recorded turn of one conversation
    pub async fn transcript(&self, conversation_id: &str) -> Result<Vec<StoredTurn>, RelayError> {
        let store = self.transcripts.as_deref().ok_or(RelayError::TranscriptsDisabled)?;
        let turns = store.conversation(conversation_id).await?;
        if turns.is_empty() {
            return Err(RelayError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(turns)
    }

    /// Relay one chat request upstream
    pub async fn chat(&self, request: ChatRequest) -> Result<RelayReply, RelayError> {
        let upstream = self.upstream.as_ref().map_err(|e| e.clone())?;
        let prepared = self.prepare(request)?;

        tracing::debug!(
            conversation_id = %prepared.conversation_id,
            model = %prepared.completion.model,
            turns = prepared.completion.messages.len(),
            stream = prepared.completion.stream,
            "relaying chat request"
        );

        if !prepared.completion.stream {
            let body = upstream.complete(&prepared.completion).await?;
            let reply = message_content(&body).map(ChatTurn::assistant);
            record_exchange(
                self.transcripts.as_deref(),
                &prepared.conversation_id,
                prepared.user_turn,
                reply,
            )
            .await;

            return Ok(RelayReply::Complete {
                conversation_id: prepared.conversation_id,
                body,
            });
        }

        let events = upstream.open_stream(&prepared.completion).await?;
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let conversation_id = prepared.conversation_id.clone();
        let transcripts = self.transcripts.clone();

        tokio::spawn(async move {
            if let Some(reply) = pump_deltas(events, tx).await {
                record_exchange(
                    transcripts.as_deref(),
                    &prepared.conversation_id,
                    prepared.user_turn,
                    Some(ChatTurn::assistant(reply)),
                )
                .await;
            }
        });

        Ok(RelayReply::Streaming {
            conversation_id,
            deltas: rx,
        })
    }

    fn prepare(&self, request: ChatRequest) -> Result<PreparedRequest, RelayError> {
        let defaults = &self.profile.defaults;

        match request {
            ChatRequest::Message(form) => {
                if form.message.trim().is_empty() {
                    return Err(RelayError::InvalidRequest("message must not be empty".into()));
                }

                let mut history = ConversationHistory::new();
                if let Some(ref system) = self.profile.prompt.system {
                    history.push(ChatTurn::system(system.as_str()));
                }
                let user_turn = ChatTurn::user(form.message);
                history.push(user_turn.clone());

                Ok(PreparedRequest {
                    conversation_id: conversation_id(form.conversation_id),
                    completion: CompletionRequest {
                        model: defaults.model.clone(),
                        messages: history.iter().map(UpstreamMessage::from).collect(),
                        temperature: defaults.temperature,
                        max_tokens: defaults.max_tokens,
                        stream: defaults.stream,
                    },
                    user_turn: Some(user_turn),
                })
            }
            ChatRequest::Completion(form) => {
                if form.messages.is_empty() {
                    return Err(RelayError::InvalidRequest("messages must not be empty".into()));
                }

                let user_turn = form
                    .messages
                    .last()
                    .filter(|turn| turn.role == Role::User)
                    .cloned();

                Ok(PreparedRequest {
                    conversation_id: conversation_id(form.conversation_id),
                    completion: CompletionRequest {
                        model: form.model.unwrap_or_else(|| defaults.model.clone()),
                        messages: form.messages.iter().map(UpstreamMessage::from).collect(),
                        temperature: form.temperature.unwrap_or(defaults.temperature),
                        max_tokens: form.max_tokens.unwrap_or(defaults.max_tokens),
                        stream: form.stream.unwrap_or(false),
                    },
                    user_turn,
                })
            }
        }
    }
}

fn conversation_id(requested: Option<String>) -> String {
    requested
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Forward deltas from `events` into `tx` until the stream ends.
///
/// Returns the full reply when the upstream finished cleanly, or `None` when
/// the upstream failed or the receiver was dropped. Dropping `events` on
/// return releases the upstream connection.
async fn pump_deltas(mut events: EventStream, tx: mpsc::Sender<String>) -> Option<String> {
    let mut reply = String::new();

    loop {
        let item = tokio::select! {
            item = events.next() => item,
            _ = tx.closed() => {
                tracing::info!("client went away mid-stream; closing upstream");
                return None;
            }
        };

        match item {
            Some(Ok(StreamEvent::Delta(text))) => {
                reply.push_str(&text);
                if tx.send(text).await.is_err() {
                    tracing::info!("client went away mid-stream; closing upstream");
                    return None;
                }
            }
            Some(Ok(StreamEvent::ParseError { line, reason })) => {
                tracing::warn!(%line, %reason, "skipping malformed upstream line");
            }
            Some(Ok(StreamEvent::Done)) | None => return Some(reply),
            Some(Err(e)) => {
                tracing::error!(
                    error = %e,
                    at = %chrono::Utc::now().to_rfc3339(),
                    "upstream stream failed; ending response"
                );
                return None;
            }
        }
    }
}

async fn record_exchange(
    store: Option<&TranscriptStore>,
    conversation_id: &str,
    user_turn: Option<ChatTurn>,
    reply: Option<ChatTurn>,
) {
    let Some(store) = store else {
        return;
    };

    let turns: Vec<ChatTurn> = user_turn.into_iter().chain(reply).collect();
    if let Err(e) = store.record_turns(conversation_id, &turns).await {
        tracing::warn!(%conversation_id, error = %e, "failed to record transcript");
    }
}
