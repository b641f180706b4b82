//! Upstream completion API integration

mod openai_compat;
mod stream;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub use openai_compat::{
    message_content, CompletionRequest, EventStream, UpstreamClient, UpstreamMessage,
};
pub use stream::StreamEvent;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Upstream returned HTTP {status}: {message}")]
    Http {
        status: StatusCode,
        /// Best-effort human readable error extracted from the body
        message: String,
        body: String,
    },

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Error envelope used by OpenAI-compatible APIs
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl ProviderError {
    /// Build an HTTP error from a non-success status and its raw body
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(resp) => resp.error.message,
            Err(_) if body.trim().is_empty() => status
                .canonical_reason()
                .unwrap_or("upstream error")
                .to_string(),
            Err(_) => body.trim().to_string(),
        };
        ProviderError::Http {
            status,
            message,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_json_envelope() {
        let err = ProviderError::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Rate limit reached","type":"rate_limit"}}"#.into(),
        );
        match err {
            ProviderError::Http { status, message, .. } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_error_message_falls_back_to_body_or_reason() {
        let err = ProviderError::from_status(StatusCode::BAD_GATEWAY, "upstream down\n".into());
        assert!(matches!(err, ProviderError::Http { ref message, .. } if message == "upstream down"));

        let err = ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new());
        assert!(
            matches!(err, ProviderError::Http { ref message, .. } if message == "Service Unavailable")
        );
    }
}
