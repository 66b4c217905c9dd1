//! In-process retry wrapped around outbound LLM calls, before the worker
//! harness's own nack/backoff ever sees the failure (§4.3, §5).

use std::future::Future;
use tokio::time::sleep;

use crate::errors::{is_retryable_llm_error, LlmError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts beyond the initial call.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { max_retries: 2, initial_delay_ms: 200, max_delay_ms: 2_000, backoff_multiplier: 2.0 }
    }
}

/// Retry an LLM call with exponential backoff. Non-retryable errors
/// (`InvalidApiKey`, `InvalidResponse`, `Unknown`) return immediately.
pub async fn retry_with_backoff<F, Fut, T>(mut operation: F, config: RetryConfig) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_error: Option<LlmError> = None;
    let mut delay_ms = config.initial_delay_ms;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    log::info!("LLM call succeeded after {} retry attempts", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable_llm_error(&error) {
                    log::warn!("non-retryable LLM error: {}", error);
                    return Err(error);
                }
                last_error = Some(error.clone());
                if attempt >= config.max_retries {
                    log::warn!("LLM call failed after {} attempts: {}", attempt + 1, error);
                    break;
                }
                log::info!("LLM call failed (attempt {}/{}): {}. Retrying in {}ms...", attempt + 1, config.max_retries + 1, error, delay_ms);
                sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms = ((delay_ms as f64) * config.backoff_multiplier) as u64;
                delay_ms = delay_ms.min(config.max_delay_ms);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| LlmError::Unknown("operation failed after retries".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig { max_retries: 3, initial_delay_ms: 5, max_delay_ms: 20, backoff_multiplier: 2.0 }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let result = retry_with_backoff(|| async { Ok::<_, LlmError>("ok") }, fast_config()).await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            || {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                async move { if count < 2 { Err(LlmError::Network("blip".to_string())) } else { Ok("ok") } }
            },
            fast_config(),
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<&str, _>(LlmError::InvalidApiKey) }
            },
            fast_config(),
        )
        .await;
        assert!(matches!(result.unwrap_err(), LlmError::InvalidApiKey));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig { max_retries: 2, initial_delay_ms: 5, max_delay_ms: 20, backoff_multiplier: 2.0 };
        let result = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<&str, _>(LlmError::RateLimitExceeded) }
            },
            config,
        )
        .await;
        assert!(matches!(result.unwrap_err(), LlmError::RateLimitExceeded));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
