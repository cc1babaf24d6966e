//! Bounded exponential backoff for transient model failures.

use super::LlmError;
use crate::classify::ErrorClassifier;
use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.clamp(1, u32::MAX as u64) as u32,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// No retries at all; used where a fallback already exists.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based). A server hint wins
    /// over the computed backoff, both capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            let exp = attempt.saturating_sub(1);
            let factor = self.multiplier.saturating_pow(exp);
            self.initial_backoff.saturating_mul(factor)
        });
        delay.min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with an error `errors` does not mark
/// retryable, or the retry budget runs out. `op` receives the zero-based
/// attempt number. Cancellation is honored both during the call and during
/// the backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    errors: &ErrorClassifier,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && errors.should_retry(&err) => {
                attempt += 1;
                let delay = policy.delay_for(attempt, err.retry_after());
                warn!(
                    "{}; retrying in {:.1}s (attempt {}/{})",
                    err,
                    delay.as_secs_f64(),
                    attempt,
                    policy.max_retries
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10, None), Duration::from_secs(30));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (errors, cancel) = (ErrorClassifier::new(), CancellationToken::new());
        let result = with_retry(&fast_policy(3), &errors, &cancel, |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::Network("reset".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (errors, cancel) = (ErrorClassifier::new(), CancellationToken::new());
        let result: Result<(), _> = with_retry(&fast_policy(3), &errors, &cancel, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn malformed_attempts(errors: ErrorClassifier) -> u32 {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> =
            with_retry(&fast_policy(2), &errors, &CancellationToken::new(), |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::MalformedResponse("cut off".into())) }
            })
            .await;
        assert!(matches!(result, Err(LlmError::MalformedResponse(_))));
        calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn classifier_decides_what_is_retried() {
        assert_eq!(malformed_attempts(ErrorClassifier::new()).await, 1);
        let lenient = ErrorClassifier::new().with_retryable(ErrorCategory::MalformedResponse, true);
        assert_eq!(malformed_attempts(lenient).await, 3);
    }

    #[tokio::test]
    async fn budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (errors, cancel) = (ErrorClassifier::new(), CancellationToken::new());
        let result: Result<(), _> = with_retry(&fast_policy(2), &errors, &cancel, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Network("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(LlmError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            multiplier: 1,
            max_backoff: Duration::from_secs(60),
        };
        let (errors, cancel) = (ErrorClassifier::new(), CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result: Result<(), _> = with_retry(&policy, &errors, &cancel, |_| async {
            Err(LlmError::Network("down".into()))
        })
        .await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }
}
