//! Bounded retry with exponential backoff
//!
//! Used by the import action wrapper to re-run optimistic image updates
//! that lost a race.

use crate::config::ActionRetryConfig;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: usize,

    pub initial_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Backoff multiplier (2.0 doubles each time)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&ActionRetryConfig::default())
    }
}

impl From<&ActionRetryConfig> for RetryConfig {
    fn from(config: &ActionRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: usize, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the retry budget is spent. Returns the last error.
pub async fn with_retry<F, Fut, T, E, P>(
    config: &RetryConfig,
    task_id: &str,
    should_retry: P,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(task_id = %task_id, attempt, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) if should_retry(&e) && attempt < config.max_retries => {
                let delay = config.calculate_delay(attempt);
                warn!(
                    task_id = %task_id,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed, giving up"
                    );
                }
                return Err(e);
            }
        }
    }
}
