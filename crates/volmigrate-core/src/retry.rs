//! Backoff for transient Kubernetes API failures
//!
//! Only idempotent reads and deletes go through here. Creations are never
//! retried: a conflict means a naming bug, not a transient condition. The
//! transfer tool has its own fixed-delay loop in [`crate::transfer`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::is_transient;

/// Backoff parameters for API calls
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, at least one is always made
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound of the delay
    pub max_delay: Duration,
    /// Growth factor of the delay
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// `should_retry` decides whether an error is worth another attempt. The
/// delay doubles (by default) from `initial_delay` with 0.5x-1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }
        if attempt >= max_attempts {
            error!(operation = %operation_name, attempt, error = %e, "giving up after retries");
            return Err(e);
        }

        let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(jittered).await;
        delay = config.next_delay(delay);
    }
}

/// [`retry_with_backoff`] with the default budget, retrying only transient API errors
pub async fn retry_api<F, Fut, T>(operation_name: &str, operation: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    retry_with_backoff(&RetryConfig::default(), operation_name, is_transient, operation).await
}
