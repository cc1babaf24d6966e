//! Failure buckets with retry decisions and user-facing hints.

use crate::error::ErrorKind;
use crate::llm::LlmError;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    KeysExhausted,
    MalformedResponse,
    ExecutionError,
    FileNotFound,
    Timeout,
    Cancelled,
    InvalidParameters,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDecision {
    pub category: ErrorCategory,
    /// Retry automatically after a backoff.
    pub retryable: bool,
    /// Show to the user instead of handing it back to the model.
    pub surface_to_user: bool,
    pub hint: &'static str,
    pub retry_after: Option<Duration>,
}

/// Single source of retry and surfacing decisions. The API layer retries
/// exactly what this marks `retryable`; the engine shows `hint` to the user
/// only for `surface_to_user` failures and hands the rest to the model.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    retry_overrides: Vec<(ErrorCategory, bool)>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change whether a category is retried by the API layer.
    pub fn with_retryable(mut self, category: ErrorCategory, retryable: bool) -> Self {
        self.retry_overrides.retain(|(c, _)| *c != category);
        self.retry_overrides.push((category, retryable));
        self
    }

    pub fn classify_llm(&self, error: &LlmError) -> ErrorDecision {
        let category = match error {
            LlmError::Network(_) => ErrorCategory::Network,
            LlmError::RateLimited { .. } => ErrorCategory::RateLimit,
            LlmError::KeysExhausted { .. } => ErrorCategory::KeysExhausted,
            LlmError::Auth(_) => ErrorCategory::InvalidParameters,
            LlmError::Http { status, .. } if *status >= 500 => ErrorCategory::Network,
            LlmError::Http { .. } => ErrorCategory::InvalidParameters,
            LlmError::MalformedResponse(_) => ErrorCategory::MalformedResponse,
            LlmError::Cancelled => ErrorCategory::Cancelled,
        };
        let mut decision = self.decision(category, error.retry_after());
        if let LlmError::Auth(_) = error {
            decision.hint = "The API key was rejected. Update CODELOOM_API_KEYS or the keychain entry.";
            decision.surface_to_user = true;
        }
        decision
    }

    /// Whether the API layer should back off and try `error` again.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        self.classify_llm(error).retryable
    }

    fn decision(&self, category: ErrorCategory, retry_after: Option<Duration>) -> ErrorDecision {
        let mut decision = Self::decide(category, retry_after);
        if let Some((_, retryable)) = self.retry_overrides.iter().find(|(c, _)| *c == category) {
            decision.retryable = *retryable;
        }
        decision
    }

    /// Classify by kind, refining generic execution failures by their text.
    pub fn classify(&self, kind: ErrorKind, message: &str) -> ErrorDecision {
        let category = match kind {
            ErrorKind::Network => ErrorCategory::Network,
            ErrorKind::RateLimited => ErrorCategory::RateLimit,
            ErrorKind::KeysExhausted => ErrorCategory::KeysExhausted,
            ErrorKind::MalformedResponse => ErrorCategory::MalformedResponse,
            ErrorKind::FileNotFound => ErrorCategory::FileNotFound,
            ErrorKind::InvalidParameters => ErrorCategory::InvalidParameters,
            ErrorKind::Cancelled => ErrorCategory::Cancelled,
            ErrorKind::Timeout => ErrorCategory::Timeout,
            ErrorKind::ToolExecution => match self.categorize_message(message) {
                ErrorCategory::Unknown => ErrorCategory::ExecutionError,
                refined => refined,
            },
            ErrorKind::ScriptStructure | ErrorKind::Incomplete => ErrorCategory::Unknown,
        };
        let mut decision = self.decision(category, None);
        match kind {
            ErrorKind::ScriptStructure => {
                decision.hint = "The script is invalid. Check labels, goto targets and placeholders.";
                decision.surface_to_user = true;
            }
            ErrorKind::Incomplete => {
                decision.hint = "The run hit its turn or tool-iteration budget. Narrow the request or raise the engine limits.";
                decision.surface_to_user = true;
            }
            _ => {}
        }
        decision
    }

    /// Best-effort bucket for free-form failure text.
    pub fn categorize_message(&self, message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["cancelled", "canceled", "aborted by user"]) {
            ErrorCategory::Cancelled
        } else if has(&["timed out", "timeout", "deadline exceeded"]) {
            ErrorCategory::Timeout
        } else if has(&["rate limit", "too many requests", "429", "quota"]) {
            ErrorCategory::RateLimit
        } else if has(&["no such file", "not found", "enoent", "does not exist"]) {
            ErrorCategory::FileNotFound
        } else if has(&[
            "connection refused",
            "connection reset",
            "dns",
            "network",
            "unreachable",
        ]) {
            ErrorCategory::Network
        } else if has(&["invalid json", "expected json", "malformed", "unexpected token"]) {
            ErrorCategory::MalformedResponse
        } else if has(&["invalid", "missing required", "must be", "expected"]) {
            ErrorCategory::InvalidParameters
        } else if has(&["exit code", "exit status", "failed", "error"]) {
            ErrorCategory::ExecutionError
        } else {
            ErrorCategory::Unknown
        }
    }

    pub fn decide(category: ErrorCategory, retry_after: Option<Duration>) -> ErrorDecision {
        let (retryable, surface_to_user, hint) = match category {
            ErrorCategory::Network => (
                true,
                true,
                "Could not reach the model service. Check your connection and try again.",
            ),
            ErrorCategory::RateLimit => (
                true,
                true,
                "The model service is rate limiting requests. Wait a moment and retry.",
            ),
            ErrorCategory::KeysExhausted => (
                false,
                true,
                "Every configured API key is rate limited. Wait for the suggested time or add another key.",
            ),
            ErrorCategory::MalformedResponse => (
                false,
                true,
                "The model returned a response that could not be understood. Retrying the request usually helps.",
            ),
            ErrorCategory::ExecutionError => (
                false,
                false,
                "The tool failed. Read the error output and adjust the call.",
            ),
            ErrorCategory::FileNotFound => (
                false,
                false,
                "The path does not exist. List the directory to find the right path.",
            ),
            ErrorCategory::Timeout => (
                false,
                false,
                "The command ran too long and was stopped. Use a narrower or non-interactive command.",
            ),
            ErrorCategory::Cancelled => (false, true, "The operation was cancelled."),
            ErrorCategory::InvalidParameters => (
                false,
                false,
                "The arguments were rejected. Check the parameter schema and try again.",
            ),
            ErrorCategory::Unknown => (false, true, "An unexpected error occurred."),
        };
        ErrorDecision {
            category,
            retryable,
            surface_to_user,
            hint,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_carry_the_wait() {
        let decision = ErrorClassifier::new().classify_llm(&LlmError::KeysExhausted {
            retry_after: Some(Duration::from_secs(20)),
        });
        assert_eq!(decision.category, ErrorCategory::KeysExhausted);
        assert!(!decision.retryable);
        assert!(decision.surface_to_user);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(20)));
    }

    #[test]
    fn rejected_key_surfaces_without_a_wait() {
        let decision = ErrorClassifier::new().classify_llm(&LlmError::Auth("401".into()));
        assert_eq!(decision.category, ErrorCategory::InvalidParameters);
        assert!(!decision.retryable);
        assert!(decision.surface_to_user);
        assert_eq!(decision.retry_after, None);
        assert!(decision.hint.contains("API key"));
    }

    #[test]
    fn retry_overrides_change_the_decision() {
        let malformed = LlmError::MalformedResponse("truncated".into());
        assert!(!ErrorClassifier::new().should_retry(&malformed));

        let classifier = ErrorClassifier::new()
            .with_retryable(ErrorCategory::MalformedResponse, true)
            .with_retryable(ErrorCategory::Network, false);
        assert!(classifier.should_retry(&malformed));
        assert!(!classifier.should_retry(&LlmError::Network("reset".into())));
        assert!(classifier.should_retry(&LlmError::RateLimited {
            message: "slow down".into(),
            retry_after: None,
        }));
    }

    #[test]
    fn server_errors_are_network() {
        let decision = ErrorClassifier::new().classify_llm(&LlmError::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        assert_eq!(decision.category, ErrorCategory::Network);
        assert!(decision.retryable);
    }

    #[test]
    fn tool_errors_are_refined_by_text() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier
                .classify(ErrorKind::ToolExecution, "open src/a.js: No such file or directory")
                .category,
            ErrorCategory::FileNotFound
        );
        assert_eq!(
            classifier
                .classify(ErrorKind::ToolExecution, "command exited with exit code 2")
                .category,
            ErrorCategory::ExecutionError
        );
        assert!(!classifier.classify(ErrorKind::Timeout, "").surface_to_user);
    }

    #[test]
    fn structure_errors_surface() {
        let decision = ErrorClassifier::new().classify(ErrorKind::ScriptStructure, "unknown label");
        assert_eq!(decision.category, ErrorCategory::Unknown);
        assert!(decision.surface_to_user);
        assert!(decision.hint.contains("script"));
    }

    #[test]
    fn free_text_buckets() {
        let c = ErrorClassifier::new();
        assert_eq!(c.categorize_message("Request timed out"), ErrorCategory::Timeout);
        assert_eq!(c.categorize_message("HTTP 429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(c.categorize_message("connection refused"), ErrorCategory::Network);
        assert_eq!(c.categorize_message("all good"), ErrorCategory::Unknown);
    }
}
