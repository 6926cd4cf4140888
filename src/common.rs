use anyhow::{Context, Result};
use cadence_config::{AppConfig, LogConfig, OutputFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，`RUST_LOG` 存在时优先于配置中的过滤规则
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))
        .context("解析日志过滤规则失败")?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        OutputFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        OutputFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        OutputFormat::Text => registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("初始化文本日志格式失败")?,
    }

    Ok(())
}

/// 加载应用配置；未指定路径时按默认位置查找，找不到则使用默认值
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[queue]\nconcurrency = 3\n\n[scheduler]\ntick_interval_ms = 250").unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.queue.concurrency, 3);
        assert_eq!(config.scheduler.tick_interval.as_millis(), 250);
    }

    #[test]
    fn test_load_config_missing_file() {
        let error = load_config(Some("/nonexistent/cadence.toml")).unwrap_err();
        assert!(error.to_string().contains("/nonexistent/cadence.toml"));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[queue]\nconcurrency = 0").unwrap();
        assert!(load_config(file.path().to_str()).is_err());
    }
}
