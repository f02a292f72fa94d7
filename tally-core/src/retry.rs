//! Retry of store conflicts
//!
//! Serializable transactions may be aborted by the store when concurrent
//! units conflict. Those aborts leave nothing behind, so the whole unit is
//! re-run in a fresh store transaction with exponential backoff and jitter.
//! Every other error is returned on the first attempt.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first; zero disables retry
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
    /// Growth per attempt
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised either way
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 250,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Conflict retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Policy from configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Fail on the first conflict
    pub fn disabled() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    /// Configured retry count
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (0-based)
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out
    ///
    /// `on_retry` is called once per retry, before sleeping.
    pub async fn run<F, Fut, T, R>(
        &self,
        operation_name: &str,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(),
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Store conflict, retrying"
                    );
                    on_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            error = %err,
                            "Store conflict, retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
