use std::future::Future;
use std::time::Duration;

use veritas_core::{LlmConfig, VeritasError};

/// Longest single backoff, whatever the attempt number or server hint.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for transient failures.
///
/// Only errors for which [`VeritasError::is_transient`] holds are retried.
/// A `RateLimited` retry-after hint replaces the computed delay.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use veritas_review::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100));
/// assert_eq!(policy.backoff(0), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Policy configured by `[llm] max_retries` and `retry_base_ms`.
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.retry_base_ms))
    }

    /// Delay before retry number `retry` (0-based), without server hints.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(MAX_DELAY)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `what` names the operation in log lines.
    ///
    /// # Errors
    ///
    /// Returns the last error from `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, VeritasError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VeritasError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry < self.max_retries => {
                    let delay = err
                        .retry_after()
                        .map(|hint| hint.min(MAX_DELAY))
                        .unwrap_or_else(|| self.backoff(retry));
                    tracing::warn!(
                        operation = what,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}
