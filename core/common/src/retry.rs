//! Bounded retry and polling with exponential backoff.
//!
//! Two loops share one budget type:
//! - [`RetryExecutor::execute`] re-runs a request that failed transiently.
//! - [`poll_until`] re-checks an eventually-consistent state (job
//!   completion, link visibility) until it is reached.
//!
//! Both honour cancellation while sleeping and report an exhausted budget
//! as an error, never as success.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::{ensure_active, sleep_cancellable, CancellationToken};
use crate::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fixed-interval schedule: `attempts` tries spaced by `interval`.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of attempts this budget allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Serializable polling budget for provider configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Number of checks before giving up.
    pub max_attempts: u32,
    /// Delay before the second check, in milliseconds.
    pub interval_ms: u64,
    /// Growth factor applied to the delay after each check.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// Upper bound for the delay, in milliseconds (defaults to `interval_ms`).
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_backoff() -> f64 {
    1.0
}

impl PollConfig {
    /// Fixed interval polling.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
            backoff: 1.0,
            max_interval_ms: None,
        }
    }

    /// Convert into a retry schedule.
    pub fn to_retry_config(&self) -> RetryConfig {
        let interval = Duration::from_millis(self.interval_ms);
        let max = self
            .max_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(interval);
        RetryConfig::fixed(self.max_attempts, interval)
            .with_backoff_multiplier(self.backoff)
            .with_max_delay(max.max(interval))
    }
}

/// Retry executor for running operations with retry logic.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying transient failures.
    ///
    /// Non-transient errors and cancellation return immediately. When the
    /// budget runs out the last transient error is returned.
    pub async fn execute<F, Fut, T>(&self, token: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            ensure_active(token)?;
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!("Attempt {} failed: {}. Retrying in {:?}...", attempt, err, delay);
                    sleep_cancellable(token, delay).await?;
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Result of one polling check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// The awaited state was reached.
    Ready(T),
    /// Not yet; check again after the next delay.
    Pending,
}

/// Check until `Ready`, within the budget of `config`.
///
/// Transient check errors count as `Pending`. Any other error is returned
/// immediately.
///
/// # Errors
/// - `Timeout` when every attempt came back pending
/// - `Cancelled` when the token fires
pub async fn poll_until<F, Fut, T>(
    config: &RetryConfig,
    token: &CancellationToken,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    let attempts = config.attempts();

    for attempt in 0..attempts {
        ensure_active(token)?;
        match check().await {
            Ok(PollStatus::Ready(value)) => {
                debug!("{} reached after {} check(s)", what, attempt + 1);
                return Ok(value);
            }
            Ok(PollStatus::Pending) => {
                debug!("{} pending (check {}/{})", what, attempt + 1, attempts);
            }
            Err(err) if err.is_transient() => {
                warn!("{} check {} failed transiently: {}", what, attempt + 1, err);
            }
            Err(err) => return Err(err),
        }

        if attempt + 1 < attempts {
            sleep_cancellable(token, config.delay_for_attempt(attempt)).await?;
        }
    }

    Err(Error::Timeout(format!(
        "{} not reached after {} attempts",
        what, attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_schedule() {
        let config = RetryConfig::fixed(5, Duration::from_millis(200));
        assert_eq!(config.attempts(), 5);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(200));
    }

    #[test]
    fn test_poll_config_conversion() {
        let poll: PollConfig =
            serde_json::from_str(r#"{"max_attempts": 4, "interval_ms": 50}"#).unwrap();
        let retry = poll.to_retry_config();
        assert_eq!(retry.attempts(), 4);
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result: Result<i32> = RetryExecutor::new(fast(3))
            .execute(&token, || {
                let count = attempt_count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Transient("503".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<i32> = RetryExecutor::new(fast(3))
            .execute(&token, || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::NotFound("gone".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let attempt_count = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<i32> = RetryExecutor::new(fast(2))
            .execute(&token, || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Network("reset".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let checks = AtomicU32::new(0);
        let token = CancellationToken::new();

        let value = poll_until(&fast(5), &token, "job", || {
            let n = checks.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(PollStatus::Pending)
                } else {
                    Ok(PollStatus::Ready("done"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_budget_exhausted() {
        let checks = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<()> = poll_until(&fast(2), &token, "job", || {
            checks.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollStatus::Pending) }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_transient_counts_as_pending() {
        let checks = AtomicU32::new(0);
        let token = CancellationToken::new();

        let value = poll_until(&fast(3), &token, "link", || {
            let n = checks.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Transient("429".to_string()))
                } else {
                    Ok(PollStatus::Ready(n))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_poll_until_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<()> =
            poll_until(&fast(3), &token, "job", || async { Ok(PollStatus::Pending) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
