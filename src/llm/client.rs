use super::models::{ModelRequest, ModelResponse};
use super::request::build_payload;
use super::response::parse_response;
use super::retry::{with_retry, RetryPolicy};
use super::LlmError;
use crate::classify::ErrorClassifier;
use crate::config::Config;
use crate::util::truncate;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Single-shot, non-streaming access to a model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError>;
}

/// `generateContent` over HTTPS with key rotation and retry.
pub struct HttpModelClient {
    http: reqwest::Client,
    base_url: Url,
    model: String,
    api_keys: Vec<String>,
    next_key: AtomicUsize,
    policy: RetryPolicy,
    errors: ErrorClassifier,
    max_output_tokens: Option<u32>,
}

impl HttpModelClient {
    pub fn new(
        base_url: Url,
        model: impl Into<String>,
        api_keys: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            model: model.into(),
            api_keys,
            next_key: AtomicUsize::new(0),
            policy: RetryPolicy::default(),
            errors: ErrorClassifier::new(),
            max_output_tokens: None,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let base_url = config.base_url().map_err(anyhow::Error::msg)?;
        let keys = config.api_keys();
        if keys.is_empty() {
            anyhow::bail!(
                "No API key configured. Set CODELOOM_API_KEYS or GEMINI_API_KEY, or store keys in the keychain."
            );
        }
        let client = Self::new(
            base_url,
            config.provider.model.clone(),
            keys,
            config.request_timeout(),
        )?
        .with_retry_policy(RetryPolicy::from(&config.retry))
        .with_max_output_tokens(config.provider.max_output_tokens);
        Ok(client)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_error_classifier(mut self, errors: ErrorClassifier) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    fn endpoint(&self) -> Result<Url, LlmError> {
        self.base_url
            .join(&format!("models/{}:generateContent", self.model))
            .map_err(|e| LlmError::Http {
                status: 0,
                message: format!("invalid endpoint for model '{}': {}", self.model, e),
            })
    }

    /// One pass over the key ring. A rate-limited key is rotated out and the
    /// next one tried immediately; only when every key is limited does the
    /// pass fail with `RateLimited` (carrying the longest hint seen).
    async fn attempt(&self, url: &Url, payload: &Value) -> Result<Value, LlmError> {
        let count = self.api_keys.len();
        if count == 0 {
            return Err(LlmError::Auth("No API key configured.".to_string()));
        }

        let start = self.next_key.load(Ordering::Relaxed) % count;
        let mut longest_hint: Option<Duration> = None;
        let mut last_message = String::new();

        for offset in 0..count {
            let index = (start + offset) % count;
            match self.send(url, &self.api_keys[index], payload).await {
                Err(LlmError::RateLimited {
                    message,
                    retry_after,
                }) => {
                    let next = (index + 1) % count;
                    self.next_key.store(next, Ordering::Relaxed);
                    if count > 1 {
                        warn!("API key {} of {} rate limited, rotating", index + 1, count);
                    }
                    longest_hint = longest_hint.max(retry_after);
                    last_message = message;
                }
                other => return other,
            }
        }

        Err(LlmError::RateLimited {
            message: last_message,
            retry_after: longest_hint,
        })
    }

    async fn send(&self, url: &Url, key: &str, payload: &Value) -> Result<Value, LlmError> {
        let response = self
            .http
            .post(url.clone())
            .header("x-goog-api-key", key)
            .json(payload)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        let header_hint = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                LlmError::MalformedResponse(format!(
                    "response is not JSON ({}): {}",
                    e,
                    truncate(&text, 200)
                ))
            });
        }

        Err(match status.as_u16() {
            429 => LlmError::RateLimited {
                message: truncate(&text, 200),
                retry_after: header_hint.or_else(|| parse_retry_after(&text)),
            },
            401 | 403 => LlmError::Auth(
                "Invalid API key. Check CODELOOM_API_KEYS or the stored keychain entry.".to_string(),
            ),
            code @ 500..=599 => LlmError::Http {
                status: code,
                message: "Server error. The service may be temporarily unavailable.".to_string(),
            },
            code => LlmError::Http {
                status: code,
                message: truncate(&text, 200),
            },
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        let url = self.endpoint()?;
        let mut request = request.clone();
        if request.max_output_tokens.is_none() {
            request.max_output_tokens = self.max_output_tokens;
        }
        let payload = build_payload(&request);
        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "calling model"
        );

        let this = self;
        let (url, payload) = (&url, &payload);
        let body = with_retry(&self.policy, &self.errors, cancel, move |_| {
            this.attempt(url, payload)
        })
        .await
        .map_err(|err| match err {
            LlmError::RateLimited { retry_after, .. } => LlmError::KeysExhausted { retry_after },
            other => other,
        })?;

        let response = parse_response(&body)?;
        if let Some(usage) = response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                output_tokens = usage.output_tokens,
                "model call complete"
            );
        }
        Ok(response)
    }
}

/// Wait hint from a rate-limit body, e.g. "retry after 12 seconds".
fn parse_retry_after(text: &str) -> Option<Duration> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
        .map(Duration::from_secs)
}
