//! Client configuration, loaded from the environment with sane defaults.

use crate::error::{Error, Result};
use std::time::Duration;
use tandem_engine::RetryPolicy;

/// Tunables for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum server entities requested per pull page
    pub pull_limit: usize,
    /// Maximum mutations dispatched per push round
    pub push_batch_limit: usize,
    /// Concurrent push requests across independent lanes
    pub push_concurrency: usize,
    /// Per-request deadline for pull and push
    pub request_timeout: Duration,
    /// Backoff policy for transient push failures
    pub retry: RetryPolicy,
    /// Periodic background sync interval
    pub sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pull_limit: 200,
            push_batch_limit: 50,
            push_concurrency: 4,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            sync_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from `TANDEM_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(limit) = read_env("TANDEM_PULL_LIMIT")? {
            config.pull_limit = parse("TANDEM_PULL_LIMIT", &limit)?;
        }
        if let Some(limit) = read_env("TANDEM_PUSH_BATCH_LIMIT")? {
            config.push_batch_limit = parse("TANDEM_PUSH_BATCH_LIMIT", &limit)?;
        }
        if let Some(n) = read_env("TANDEM_PUSH_CONCURRENCY")? {
            config.push_concurrency = parse("TANDEM_PUSH_CONCURRENCY", &n)?;
        }
        if let Some(secs) = read_env("TANDEM_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout =
                Duration::from_secs(parse("TANDEM_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = read_env("TANDEM_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(parse("TANDEM_SYNC_INTERVAL_SECS", &secs)?);
        }
        if let Some(n) = read_env("TANDEM_MAX_ATTEMPTS")? {
            config.retry.max_attempts = parse("TANDEM_MAX_ATTEMPTS", &n)?;
        }
        if let Some(ms) = read_env("TANDEM_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = parse("TANDEM_RETRY_BASE_DELAY_MS", &ms)?;
        }
        if let Some(ms) = read_env("TANDEM_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = parse("TANDEM_RETRY_MAX_DELAY_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pull_limit == 0 {
            return Err(Error::Config("pull_limit must be positive".into()));
        }
        if self.push_batch_limit == 0 {
            return Err(Error::Config("push_batch_limit must be positive".into()));
        }
        if self.push_concurrency == 0 {
            return Err(Error::Config("push_concurrency must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".into()));
        }
        Ok(())
    }
}

fn read_env(key: &str) -> Result<Option<String>> {
    match std::env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{key}: {e}"))),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pull_limit, 200);
        assert_eq!(config.retry.max_attempts, 8);
    }

    #[test]
    fn zero_limits_rejected() {
        let config = Config {
            pull_limit: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
