//! Retry logic with exponential backoff for transient collaborator errors.

use std::future::Future;
use std::time::Duration;

use crate::error::CollaboratorError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback for retry progress notifications.
pub trait RetryCallback: Send + Sync {
    /// Called before sleeping ahead of attempt `attempt + 1`.
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &CollaboratorError, delay: Duration);
}

/// Outcome of a retried operation: the result and how many attempts it took.
pub struct Retried<T> {
    pub result: Result<T, CollaboratorError>,
    pub attempts: u32,
}

/// Execute an async operation with retry logic.
///
/// Retries while the operation returns a retryable error, sleeping with
/// exponential backoff (on the tokio clock) between attempts.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                return Retried {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt - 1);
                if let Some(cb) = callback {
                    cb.on_retry(attempt, max_attempts, &e, delay);
                }
                log::debug!("Attempt {attempt}/{max_attempts} failed: {e}. Retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::new(5, Duration::from_secs(10), 2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(20));
        // capped at max_delay
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_with_retry_success_first_try() {
        let retried = with_retry(&RetryConfig::no_retry(), None, || async { Ok(42) }).await;
        assert_eq!(retried.result.unwrap(), 42);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn test_with_retry_permanent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let retried: Retried<()> = with_retry(&fast_config(), None, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::permanent("invalid cidr")) }
        })
        .await;

        assert!(retried.result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_eventual_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let retried = with_retry(&fast_config(), None, || {
            let current = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if current < 2 {
                    Err(CollaboratorError::transient("throttled"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(retried.result.unwrap(), 7);
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_invoked() {
        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &CollaboratorError, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(Arc::clone(&count));

        let retried: Retried<()> = with_retry(&fast_config(), Some(&callback), || async {
            Err(CollaboratorError::transient("connection reset"))
        })
        .await;

        assert_eq!(retried.attempts, 3);
        // Called for each retry (not the first attempt, not the last)
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
