//! Delay calculation between retry attempts.

use std::time::Duration;

use cadence_config::BackoffKind;
use rand::Rng;

/// Backoff strategy, each variant carrying only the parameters it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed { delay: Duration },
    /// `step * attempt`.
    Linear { step: Duration },
    /// `base * 2^(attempt - 1)`.
    Exponential { base: Duration },
}

impl Backoff {
    pub fn from_kind(kind: BackoffKind, delay: Duration) -> Self {
        match kind {
            BackoffKind::Fixed => Backoff::Fixed { delay },
            BackoffKind::Linear => Backoff::Linear { step: delay },
            BackoffKind::Exponential => Backoff::Exponential { base: delay },
        }
    }

    /// Delay to wait after the failed attempt `attempt` (numbered from 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base } => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Backoff plus the optional jitter and ceiling applied on top of it.
#[derive(Debug, Clone, Copy)]
pub struct DelayCalculator {
    backoff: Backoff,
    jitter: bool,
    max_delay: Option<Duration>,
}

impl DelayCalculator {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            jitter: false,
            max_delay: None,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.backoff.delay_for(attempt);
        if self.jitter {
            delay = add_jitter(delay);
        }
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Adds a uniformly random extra in `[0, delay]`, so the result lies in `[delay, 2 * delay]`.
pub fn add_jitter(delay: Duration) -> Duration {
    let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return delay;
    }
    let extra = rand::rng().random_range(0..=nanos);
    delay.saturating_add(Duration::from_nanos(extra))
}
