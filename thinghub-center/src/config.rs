//! Center configuration
//!
//! Tick intervals and pool sizes of the center loops, plus the configuration
//! of the runner the center launches.

use std::time::Duration;
use thinghub_runner::RunnerConfig;
use thinghub_runner::config::{env_millis, env_parse};

#[derive(Debug, Clone)]
pub struct CenterConfig {
    /// How often pending jobs are rolled out
    pub schedule_interval: Duration,

    /// How often jobs awaiting a completion check are checked
    pub check_job_interval: Duration,

    /// Max management messages applied concurrently
    pub pool_size: usize,

    /// Timeout of synchronous introspection round trips
    pub query_timeout: Duration,

    pub runner: RunnerConfig,
}

impl CenterConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables, all optional:
    /// - THINGHUB_SCHEDULE_INTERVAL_MS (default: 100)
    /// - THINGHUB_CHECK_JOB_INTERVAL_MS (default: 1000)
    /// - THINGHUB_CENTER_POOL_SIZE (default: 100)
    /// - THINGHUB_QUERY_TIMEOUT_MS (default: 1000)
    ///
    /// plus everything read by [`RunnerConfig::from_env`].
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            schedule_interval: env_millis("THINGHUB_SCHEDULE_INTERVAL_MS")?
                .unwrap_or(defaults.schedule_interval),
            check_job_interval: env_millis("THINGHUB_CHECK_JOB_INTERVAL_MS")?
                .unwrap_or(defaults.check_job_interval),
            pool_size: env_parse("THINGHUB_CENTER_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            query_timeout: env_millis("THINGHUB_QUERY_TIMEOUT_MS")?
                .unwrap_or(defaults.query_timeout),
            runner: RunnerConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.schedule_interval.is_zero() {
            anyhow::bail!("schedule_interval must be greater than 0");
        }

        if self.check_job_interval.is_zero() {
            anyhow::bail!("check_job_interval must be greater than 0");
        }

        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if self.query_timeout.is_zero() {
            anyhow::bail!("query_timeout must be greater than 0");
        }

        self.runner.validate()
    }
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_millis(100),
            check_job_interval: Duration::from_secs(1),
            pool_size: 100,
            query_timeout: Duration::from_secs(1),
            runner: RunnerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CenterConfig::default();
        assert_eq!(config.schedule_interval, Duration::from_millis(100));
        assert_eq!(config.check_job_interval, Duration::from_secs(1));
        assert_eq!(config.pool_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CenterConfig::default();

        config.check_job_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.check_job_interval = Duration::from_secs(1);

        config.pool_size = 0;
        assert!(config.validate().is_err());
        config.pool_size = 4;

        config.runner.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
