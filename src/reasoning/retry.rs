//! Retry with exponential backoff for reasoning calls

use log::{debug, warn};
use rand::RngCore;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::core::config::ReasoningConfig;
use crate::core::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on each individual attempt
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &ReasoningConfig, attempt_timeout_ms: u64) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms.max(config.initial_backoff_ms),
            attempt_timeout_ms,
        }
    }

    /// Delay before attempt `attempt + 1`: `initial * 2^(attempt-1)`, capped,
    /// plus up to half the initial backoff of jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter_range = self.initial_backoff_ms / 2;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rand::rng().next_u64() % (jitter_range + 1)
        };
        Duration::from_millis(base + jitter)
    }
}

/// Run `op` until it succeeds, a non-recoverable error occurs, or attempts run
/// out. Each attempt is bounded by `attempt_timeout_ms`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(Duration::from_millis(policy.attempt_timeout_ms), op()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "{} exceeded {}ms",
                label, policy.attempt_timeout_ms
            ))),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_recoverable() {
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            warn!("{} failed after {} attempts: {}", label, attempt, err);
            return Err(EngineError::ReasoningService(format!(
                "{} failed after {} attempts: {}",
                label, attempt, err
            )));
        }

        let delay = policy.delay_after(attempt);
        warn!(
            "{} attempt {}/{} failed ({}), retrying in {:?}",
            label, attempt, policy.max_attempts, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}
