#[cfg(test)]
mod loading_tests {
    use crate::{AppConfig, BackoffKind};
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Failed to create temp file");
        file.write_all(contents.as_bytes())
            .expect("Failed to write config");
        file
    }

    // File and environment layering share process-wide env state, so they run in one test.
    #[test]
    fn test_file_and_environment_loading() {
        let file = write_config(
            r#"
[queue]
concurrency = 3

[resilience.retry]
retries = 2
delay_ms = 50
backoff = "fixed"
"#,
        );
        let path = file.path().to_str().unwrap();

        let config = AppConfig::load(Some(path)).expect("Failed to load config");
        assert_eq!(config.queue.concurrency, 3);
        assert_eq!(config.resilience.retry.retries, 2);
        assert_eq!(config.resilience.retry.delay, Duration::from_millis(50));
        assert_eq!(config.resilience.retry.backoff, BackoffKind::Fixed);
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(1));

        std::env::set_var("CADENCE__QUEUE__CONCURRENCY", "7");
        std::env::set_var("CADENCE__SCHEDULER__TICK_INTERVAL_MS", "200");
        let result = AppConfig::load(Some(path));
        std::env::remove_var("CADENCE__QUEUE__CONCURRENCY");
        std::env::remove_var("CADENCE__SCHEDULER__TICK_INTERVAL_MS");

        let config = result.expect("Failed to load config with env overrides");
        assert_eq!(config.queue.concurrency, 7);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(200));
        assert_eq!(config.resilience.retry.retries, 2);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let file = write_config("[resilience.rate_limiter]\nlimit = 0\n");
        let result = AppConfig::load(Some(file.path().to_str().unwrap()));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_converts_to_cadence_error() {
        use crate::ConfigValidator;

        let mut config = AppConfig::default();
        config.queue.concurrency = 0;
        let err: cadence_errors::CadenceError = config.validate().unwrap_err().into();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("queue.concurrency"));
    }
}
