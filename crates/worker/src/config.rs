//! Command-line / environment configuration.

use std::time::Duration;

use clap::Parser;

use loyalty_infra::reconciliation::{ConfigError, ReconcilerConfig};
use loyalty_observability::LogFormat;

/// Background worker that reconciles submitted orders with the accrual service.
#[derive(Debug, Clone, Parser)]
#[command(name = "loyalty-worker", version)]
pub struct Cli {
    /// Accrual service address (scheme optional)
    #[arg(short = 'r', long = "accrual-address", env = "ACCRUAL_SYSTEM_ADDRESS")]
    pub accrual_address: String,

    /// Postgres connection string
    #[arg(short = 'd', long = "database-uri", env = "DATABASE_URI", hide_env_values = true)]
    pub database_uri: String,

    /// Seconds between polls for unreconciled orders
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Capacity of the work queue between poller and workers
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 10)]
    pub queue_capacity: usize,

    /// Maximum concurrent reconciliation attempts
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 8)]
    pub max_concurrent: usize,

    /// Upper bound in seconds for a single accrual query
    #[arg(long, env = "ACCRUAL_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Log output: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Immutable pipeline configuration derived from the flags.
    pub fn reconciler_config(&self) -> Result<ReconcilerConfig, ConfigError> {
        let config = ReconcilerConfig::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_queue_capacity(self.queue_capacity)
            .with_max_concurrent(self.max_concurrent)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs));
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["loyalty-worker"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn short_flags_and_defaults() {
        let cli = parse(&["-r", "localhost:8081", "-d", "postgres://localhost/loyalty"]).unwrap();
        assert_eq!(cli.accrual_address, "localhost:8081");
        assert_eq!(cli.database_uri, "postgres://localhost/loyalty");

        let config = cli.reconciler_config().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn long_flags_override_defaults() {
        let cli = parse(&[
            "--accrual-address",
            "http://accrual:8080",
            "--database-uri",
            "postgres://db/loyalty",
            "--poll-interval-secs",
            "2",
            "--max-concurrent",
            "1",
            "--log-format",
            "pretty",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Pretty);
        let config = cli.reconciler_config().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn zero_values_are_rejected() {
        let cli = parse(&["-r", "a", "-d", "b", "--queue-capacity", "0"]).unwrap();
        assert_eq!(cli.reconciler_config(), Err(ConfigError::Zero("queue_capacity")));
    }

    #[test]
    fn unknown_log_format_is_a_parse_error() {
        assert!(parse(&["-r", "a", "-d", "b", "--log-format", "xml"]).is_err());
    }
}
