use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgMatches, Command};
use tracing::{debug, info};

use cadence::common::{init_logging, load_config};
use cadence::config::{LogConfig, LogLevel, OutputFormat};
use cadence::CronExpression;

fn cli() -> Command {
    Command::new("cadence")
        .version(env!("CARGO_PKG_VERSION"))
        .about("进程内任务调度与弹性原语")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .global(true)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("warn"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .global(true)
                .value_parser(["json", "pretty", "text"])
                .default_value("text"),
        )
        .subcommand(
            Command::new("cron")
                .about("计算CRON表达式接下来的执行时间")
                .arg(
                    Arg::new("expr")
                        .value_name("EXPR")
                        .help("5或6字段的CRON表达式")
                        .required(true),
                )
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_name("N")
                        .help("输出的执行时间个数")
                        .value_parser(value_parser!(usize))
                        .default_value("5"),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("RFC3339")
                        .help("起始时间，默认为当前时间"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("加载并校验配置，输出生效的配置")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("配置文件路径"),
                ),
        )
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    let log_config = log_config_from(&matches)?;
    init_logging(&log_config)?;

    match matches.subcommand() {
        Some(("cron", args)) => print_upcoming(args),
        Some(("check-config", args)) => check_config(args),
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn log_config_from(matches: &ArgMatches) -> Result<LogConfig> {
    let level = matches
        .get_one::<String>("log-level")
        .map(|level| level.parse::<LogLevel>())
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();
    let format = matches
        .get_one::<String>("log-format")
        .map(|format| format.parse::<OutputFormat>())
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();

    Ok(LogConfig::with_level(level).with_format(format))
}

fn print_upcoming(args: &ArgMatches) -> Result<()> {
    let expr = args
        .get_one::<String>("expr")
        .context("缺少CRON表达式")?;
    let count = args.get_one::<usize>("count").copied().unwrap_or(5);
    let from = match args.get_one::<String>("from") {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("无法解析起始时间: {raw}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let cron = CronExpression::parse(expr)?;
    debug!("计算 {} 自 {} 起的 {} 个执行时间", cron, from, count);

    let upcoming = cron.upcoming(from, count);
    if upcoming.is_empty() {
        println!("'{cron}' 在可搜索范围内没有匹配的执行时间");
        return Ok(());
    }
    for instant in upcoming {
        println!("{}", instant.to_rfc3339());
    }
    Ok(())
}

fn check_config(args: &ArgMatches) -> Result<()> {
    let path = args.get_one::<String>("config").map(String::as_str);
    let config = load_config(path)?;
    info!("配置校验通过");
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_global_log_flags_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["cadence", "cron", "0 0 * * *", "--log-level", "debug"])
            .unwrap();
        let config = log_config_from(&matches).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, OutputFormat::Text);
    }

    #[test]
    fn test_cron_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "cadence",
                "cron",
                "*/5 * * * * *",
                "-n",
                "3",
                "--from",
                "2024-01-01T00:00:00Z",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "cron");
        assert_eq!(args.get_one::<usize>("count"), Some(&3));
        assert!(print_upcoming(args).is_ok());
    }

    #[test]
    fn test_invalid_cron_is_reported() {
        let matches = cli()
            .try_get_matches_from(["cadence", "cron", "61 * * * *"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(print_upcoming(args).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(cli().try_get_matches_from(["cadence"]).is_err());
    }
}
