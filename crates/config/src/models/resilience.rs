use crate::circuit_breaker::CircuitBreakerConfig;
use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!(
                "Invalid backoff: {s}. Valid options: fixed, linear, exponential"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `retries = 3` means at most 4 attempts.
    pub retries: u32,
    #[serde(rename = "delay_ms", with = "crate::duration_ms")]
    pub delay: Duration,
    pub backoff: BackoffKind,
    pub jitter: bool,
    #[serde(
        rename = "max_delay_ms",
        with = "crate::duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(1),
            backoff: BackoffKind::Exponential,
            jitter: false,
            max_delay: None,
        }
    }
}

impl RetryConfig {
    pub fn new(retries: u32, delay: Duration, backoff: BackoffKind) -> Self {
        Self {
            retries,
            delay,
            backoff,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.delay {
                return Err(crate::ConfigError::Validation(format!(
                    "retry.max_delay_ms ({}) must be greater than or equal to retry.delay_ms ({})",
                    max_delay.as_millis(),
                    self.delay.as_millis()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub limit: usize,
    #[serde(rename = "window_ms", with = "crate::duration_ms")]
    pub window: Duration,
    #[serde(rename = "prune_interval_ms", with = "crate::duration_ms")]
    pub prune_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// The prune interval follows the window unless set explicitly.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            prune_interval: window,
        }
    }
}

impl ConfigValidator for RateLimiterConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(self.limit, "rate_limiter.limit")?;
        ValidationUtils::validate_non_zero_duration(self.window, "rate_limiter.window_ms")?;
        ValidationUtils::validate_non_zero_duration(
            self.prune_interval,
            "rate_limiter.prune_interval_ms",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
}

impl ConfigValidator for ResilienceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_config_default() {
        let config = ResilienceConfig::default();

        assert_eq!(config.retry.retries, 3);
        assert_eq!(config.retry.delay, Duration::from_secs(1));
        assert_eq!(config.retry.backoff, BackoffKind::Exponential);
        assert!(!config.retry.jitter);

        assert_eq!(config.circuit_breaker.failure_threshold, 5);

        assert_eq!(config.rate_limiter.limit, 100);
        assert_eq!(config.rate_limiter.window, Duration::from_secs(60));
    }

    #[test]
    fn test_resilience_config_validation() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.rate_limiter.limit = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.rate_limiter.window = Duration::ZERO;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.circuit_breaker.failure_threshold = 0;
        assert!(invalid_config.validate().is_err());

        // max_delay below the base delay
        let mut invalid_config = config;
        invalid_config.retry = RetryConfig::new(3, Duration::from_millis(500), BackoffKind::Fixed)
            .with_max_delay(Duration::from_millis(100));
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_retry_config_zero_values_are_valid() {
        let config = RetryConfig::new(0, Duration::ZERO, BackoffKind::Linear);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_kind_from_str() {
        assert_eq!("fixed".parse::<BackoffKind>().unwrap(), BackoffKind::Fixed);
        assert_eq!("Linear".parse::<BackoffKind>().unwrap(), BackoffKind::Linear);
        assert_eq!(
            "EXPONENTIAL".parse::<BackoffKind>().unwrap(),
            BackoffKind::Exponential
        );
        assert!("fibonacci".parse::<BackoffKind>().is_err());
    }

    #[test]
    fn test_rate_limiter_config_new_uses_window_for_pruning() {
        let config = RateLimiterConfig::new(3, Duration::from_millis(2000));
        assert_eq!(config.prune_interval, Duration::from_millis(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resilience_config_serialization() {
        let config = ResilienceConfig::default();

        let serialized = serde_json::to_string(&config).expect("Failed to serialize");
        assert!(serialized.contains("\"backoff\":\"exponential\""));
        assert!(!serialized.contains("max_delay_ms"));

        let deserialized: ResilienceConfig =
            serde_json::from_str(&serialized).expect("Failed to deserialize");
        assert_eq!(config.retry.delay, deserialized.retry.delay);
        assert_eq!(config.rate_limiter.limit, deserialized.rate_limiter.limit);
    }
}
