//! API routes

use std::convert::Infallible;
use std::path::Path;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::core::{ChatRequest, RelayError, RelayReply};
use crate::AppState;

/// Response header carrying the transcript conversation id
pub const CONVERSATION_HEADER: HeaderName = HeaderName::from_static("x-conversation-id");

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    chat_configured: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        chat_configured: state.relay.is_configured(),
    })
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let Json(request) = payload.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;

    let (conversation_id, mut response) = match state.relay.chat(request).await? {
        RelayReply::Complete {
            conversation_id,
            body,
        } => (conversation_id, Json(body).into_response()),
        RelayReply::Streaming {
            conversation_id,
            mut deltas,
        } => {
            let body = Body::from_stream(async_stream::stream! {
                while let Some(delta) = deltas.recv().await {
                    yield Ok::<_, Infallible>(delta);
                }
            });
            let response = (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response();
            (conversation_id, response)
        }
    };

    if let Ok(value) = HeaderValue::from_str(&conversation_id) {
        response.headers_mut().insert(CONVERSATION_HEADER, value);
    }
    Ok(response)
}

async fn list_conversations(State(state): State<AppState>) -> Result<Json<Value>, RelayError> {
    let conversations = state.relay.conversations().await?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn get_conversation(
    State(state): State<AppState>,
    UrlPath(conversation_id): UrlPath<String>,
) -> Result<Json<Value>, RelayError> {
    let turns = state.relay.transcript(&conversation_id).await?;
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "turns": turns,
    })))
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let at = chrono::Utc::now().to_rfc3339();

        let (status, body) = match &self {
            RelayError::ConfigurationMissing(e) => {
                tracing::warn!(%at, "chat refused: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": self.to_string() }),
                )
            }
            RelayError::UpstreamHttp {
                status,
                message,
                body,
            } => {
                tracing::error!(status, %body, %at, "upstream rejected chat request");
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                (
                    status,
                    json!({
                        "error": format!("Upstream service returned {}", status),
                        "details": message,
                    }),
                )
            }
            RelayError::UpstreamParse(msg) => {
                tracing::error!(error = %msg, %at, "unreadable upstream response");
                (StatusCode::BAD_GATEWAY, json!({ "error": self.to_string() }))
            }
            RelayError::Transport(msg) => {
                tracing::error!(error = %msg, %at, "upstream request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            RelayError::InvalidRequest(msg) => {
                tracing::debug!(error = %msg, "rejected chat request");
                (StatusCode::BAD_REQUEST, json!({ "error": self.to_string() }))
            }
            RelayError::TranscriptsDisabled | RelayError::ConversationNotFound(_) => {
                (StatusCode::NOT_FOUND, json!({ "error": self.to_string() }))
            }
            RelayError::Storage(e) => {
                tracing::error!(error = %e, %at, "transcript read failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub fn router(static_dir: &Path) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(get_conversation))
        .fallback_service(ServeDir::new(static_dir))
}
