use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound of the scheduler tick; due tasks are never detected later than this.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "tick_interval_ms", with = "crate::duration_ms")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: MAX_TICK_INTERVAL,
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_duration_range(
            self.tick_interval,
            Duration::from_millis(1),
            MAX_TICK_INTERVAL,
            "scheduler.tick_interval_ms",
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub autostart: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            autostart: true,
        }
    }
}

impl QueueConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn paused(mut self) -> Self {
        self.autostart = false;
        self
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(self.concurrency, "queue.concurrency")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let fast = SchedulerConfig {
            tick_interval: Duration::from_millis(10),
        };
        assert!(fast.validate().is_ok());

        let zero = SchedulerConfig {
            tick_interval: Duration::ZERO,
        };
        assert!(zero.validate().is_err());

        let coarse = SchedulerConfig {
            tick_interval: Duration::from_secs(5),
        };
        assert!(coarse.validate().is_err());
    }

    #[test]
    fn test_queue_config_validation() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 10);
        assert!(config.autostart);
        assert!(config.validate().is_ok());

        assert!(QueueConfig::with_concurrency(0).validate().is_err());

        let paused = QueueConfig::with_concurrency(2).paused();
        assert_eq!(paused.concurrency, 2);
        assert!(!paused.autostart);
    }
}
