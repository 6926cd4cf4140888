//! Retry with backoff for fallible async operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_config::{ConfigValidator, RetryConfig};
use cadence_errors::{CadenceError, CadenceResult};
use metrics::counter;
use tracing::{debug, warn};

use crate::backoff::{Backoff, DelayCalculator};

/// Called with the failed attempt's error and its number, before sleeping.
pub type OnRetry = Arc<dyn Fn(&CadenceError, u32) + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(&CadenceError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    delays: DelayCalculator,
    on_retry: Option<OnRetry>,
    retry_if: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> CadenceResult<Self> {
        config.validate()?;
        let delays = DelayCalculator::new(Backoff::from_kind(config.backoff, config.delay))
            .with_jitter(config.jitter)
            .with_max_delay(config.max_delay);
        Ok(Self {
            config,
            delays,
            on_retry: None,
            retry_if: None,
        })
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CadenceError, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Errors rejected by the predicate fail immediately, unwrapped.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CadenceError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.retries.saturating_add(1)
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        self.delays.compute_delay(attempt)
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> CadenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let Some(predicate) = &self.retry_if {
                if !predicate(&error) {
                    debug!(attempt, %error, "Error is not retryable, giving up");
                    return Err(error);
                }
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, %error, "Retry attempts exhausted");
                counter!("cadence_retry_exhausted_total").increment(1);
                return Err(CadenceError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            if let Some(callback) = &self.on_retry {
                callback(&error, attempt);
            }

            let delay = self.compute_delay(attempt);
            debug!(attempt, ?delay, %error, "Attempt failed, retrying after delay");
            counter!("cadence_retry_attempts_total").increment(1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// One-off retry without keeping a policy around.
pub async fn retry<F, Fut, T>(config: RetryConfig, operation: F) -> CadenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CadenceResult<T>>,
{
    RetryPolicy::new(config)?.execute(operation).await
}
