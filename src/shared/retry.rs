//! Retry with exponential backoff for transient transport failures.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy applied to network operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay; attempt `n` sleeps `retry_backoff * 2^(n-1)`.
    pub retry_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from the config-file fields (seconds).
    pub fn new(max_retries: u32, retry_backoff_secs: u64) -> Self {
        Self {
            max_retries,
            retry_backoff: Duration::from_secs(retry_backoff_secs),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Delay before re-running after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff * 2u32.saturating_pow(exponent)
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// `op` is invoked at most `max_retries + 1` times. Only failures for which
/// [`crate::Error::is_retryable`] holds are retried; everything else (JSON-RPC
/// errors, authorization failures) is re-raised immediately, as is the final
/// failure once the attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, error = %err, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            },
            Err(err) => return Err(err),
        }
    }
}
