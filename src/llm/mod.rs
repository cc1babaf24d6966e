//! Model API layer
//!
//! Every call is single-shot and non-streaming: the whole response is
//! validated and parsed before the engine sees any of it.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod models;
pub mod parse;
pub mod prompts;
pub mod request;
pub mod response;
pub mod retry;

pub use client::{HttpModelClient, ModelClient};
pub use models::{
    ChatMessage, ChatRole, FunctionCall, FunctionDeclaration, FunctionResponse, ModelRequest,
    ModelResponse, Part, Usage,
};
pub use parse::parse_structured;
pub use retry::RetryPolicy;

use crate::error::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("All API keys are rate limited")]
    KeysExhausted { retry_after: Option<Duration> },
    #[error("API key rejected: {0}")]
    Auth(String),
    #[error("API error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
    #[error("Model call cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Network(_) => ErrorKind::Network,
            LlmError::RateLimited { .. } => ErrorKind::RateLimited,
            LlmError::KeysExhausted { .. } => ErrorKind::KeysExhausted,
            // Waiting does not fix a rejected key.
            LlmError::Auth(_) => ErrorKind::InvalidParameters,
            LlmError::Http { status, .. } if *status >= 500 => ErrorKind::Network,
            LlmError::Http { .. } => ErrorKind::InvalidParameters,
            LlmError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            LlmError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Suggested wait before the caller tries again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } | LlmError::KeysExhausted { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_kind() {
        let server = LlmError::Http {
            status: 503,
            message: "unavailable".into(),
        };
        let client = LlmError::Http {
            status: 400,
            message: "bad request".into(),
        };
        assert_eq!(server.kind(), ErrorKind::Network);
        assert_eq!(client.kind(), ErrorKind::InvalidParameters);
    }

    #[test]
    fn rejected_key_is_not_a_wait() {
        let err = LlmError::Auth("nope".into());
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn retry_after_is_exposed_for_rate_limits() {
        let err = LlmError::KeysExhausted {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.kind(), ErrorKind::KeysExhausted);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(LlmError::Network("x".into()).retry_after(), None);
    }
}
