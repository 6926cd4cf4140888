use std::time::Duration;

use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a count is strictly positive
    pub fn validate_positive(count: usize, field_name: &str) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// Validate that a duration is not zero
    pub fn validate_non_zero_duration(duration: Duration, field_name: &str) -> ConfigResult<()> {
        if duration.is_zero() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// Validate that a duration lies within `[min, max]`
    pub fn validate_duration_range(
        duration: Duration,
        min: Duration,
        max: Duration,
        field_name: &str,
    ) -> ConfigResult<()> {
        if duration < min || duration > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be between {}ms and {}ms, got {}ms",
                min.as_millis(),
                max.as_millis(),
                duration.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(ValidationUtils::validate_positive(1, "concurrency").is_ok());
        let err = ValidationUtils::validate_positive(0, "concurrency").unwrap_err();
        assert!(err.to_string().contains("concurrency must be greater than 0"));
    }

    #[test]
    fn test_validate_duration_range() {
        let min = Duration::from_millis(1);
        let max = Duration::from_secs(1);
        assert!(ValidationUtils::validate_duration_range(Duration::from_millis(500), min, max, "tick").is_ok());
        assert!(ValidationUtils::validate_duration_range(Duration::ZERO, min, max, "tick").is_err());
        assert!(ValidationUtils::validate_duration_range(Duration::from_secs(2), min, max, "tick").is_err());
    }
}
