//! Bounded retry with exponential backoff.
//!
//! Delay after the n-th failed attempt: 2^n × base_delay, capped at max_delay.
//! `max_attempts` counts the first try, so 2 means one retry.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use wahub_core::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Sleeps between attempts. Always at least one attempt is made, even
    /// when `max_attempts` is zero.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base_ms = self.base_delay.as_millis() as u64;
        ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts. `op`
/// receives the 1-based attempt number. Returns the last error on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    Retry::spawn(policy.delays(), || {
        attempt += 1;
        op(attempt)
    })
    .await
}

// ============================================================================
// TESTS
// ============================================================================
