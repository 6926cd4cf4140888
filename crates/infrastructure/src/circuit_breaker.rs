//! Circuit breaker for resilience
//!
//! Three-state guard around a fallible operation. Admission never suspends:
//! `execute` either starts the operation at once or fails with
//! [`CadenceError::CircuitOpen`] without invoking it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cadence_config::{CircuitBreakerConfig, CircuitState, ConfigValidator};
use cadence_errors::{CadenceError, CadenceResult};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub opened_at: Option<Instant>,
    pub last_state_change: Instant,
    pub last_error: Option<String>,
}

impl CircuitBreakerStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            opened_at: None,
            last_state_change: Instant::now(),
            last_error: None,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    stats: CircuitBreakerStats,
    trial_in_flight: bool,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.stats.state;
        if from == to {
            return;
        }
        self.stats.state = to;
        self.stats.last_state_change = now;
        debug!(%from, %to, "Circuit breaker state transition");
        counter!("cadence_circuit_breaker_transitions_total", "to" => to.to_string())
            .increment(1);
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            state: Arc::new(Mutex::new(BreakerState {
                stats: CircuitBreakerStats::new(),
                trial_in_flight: false,
            })),
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> CadenceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `operation` if the breaker admits the call. A failure of the
    /// operation is returned unchanged after being counted.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CadenceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        let permit = self.admit()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(error) => permit.fail(error.to_string()),
        }
        result
    }

    fn admit(&self) -> CadenceResult<Permit<'_>> {
        let now = Instant::now();
        let mut state = self.lock();

        let current = state.stats.state;
        let trial = match current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = state.stats.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.config.reset_timeout {
                    return Err(self.reject(&mut state, self.config.reset_timeout - elapsed));
                }
                state.transition(CircuitState::HalfOpen, now);
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(self.reject(&mut state, Duration::ZERO));
                }
                true
            }
        };

        if trial {
            state.trial_in_flight = true;
            debug!("Circuit breaker admitting half-open trial call");
        }

        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn reject(&self, state: &mut BreakerState, retry_after: Duration) -> CadenceError {
        state.stats.rejected_calls += 1;
        counter!("cadence_circuit_breaker_rejected_total").increment(1);
        debug!(?retry_after, "Circuit breaker rejected call");
        CadenceError::CircuitOpen { retry_after }
    }

    fn record_success(&self, trial: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        if trial {
            state.trial_in_flight = false;
        }

        let stats = &mut state.stats;
        stats.total_calls += 1;
        stats.successful_calls += 1;
        stats.consecutive_failures = 0;

        if trial && state.stats.state == CircuitState::HalfOpen {
            state.stats.opened_at = None;
            state.transition(CircuitState::Closed, now);
        }
    }

    fn record_failure(&self, trial: bool, error: String) {
        let now = Instant::now();
        let mut state = self.lock();
        if trial {
            state.trial_in_flight = false;
        }

        let stats = &mut state.stats;
        stats.total_calls += 1;
        stats.failed_calls += 1;
        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.last_error = Some(error);

        let current = state.stats.state;
        let failures = state.stats.consecutive_failures;
        match current {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                warn!(
                    failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opening"
                );
                state.stats.opened_at = Some(now);
                state.transition(CircuitState::Open, now);
            }
            CircuitState::HalfOpen if trial => {
                warn!("Circuit breaker trial call failed, reopening");
                state.stats.opened_at = Some(now);
                state.transition(CircuitState::Open, now);
            }
            _ => {}
        }
    }

    /// Stored state. An elapsed Open breaker only moves to Half-Open on the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().stats.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.lock().stats.clone()
    }

    /// Forces the breaker back to Closed with a zero failure count.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.stats.consecutive_failures = 0;
        state.stats.opened_at = None;
        state.trial_in_flight = false;
        state.transition(CircuitState::Closed, now);
    }
}

/// Admission token for one call. Dropping it unsettled, e.g. when the caller's
/// future is cancelled mid-operation, counts as a failure so a half-open trial
/// slot is never leaked.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(mut self, error: String) {
        self.settled = true;
        self.breaker.record_failure(self.trial, error);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker
                .record_failure(self.trial, "call cancelled before completion".to_string());
        }
    }
}
