//! Runner configuration
//!
//! Dispatch cadence, worker pool size and retry backoff of the runner.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often the dispatch loop pops tasks
    pub dispatch_interval: Duration,

    /// Max tasks popped per dispatch tick
    pub dispatch_per_tick: usize,

    /// Max concurrent device calls
    pub pool_size: usize,

    /// Timeout of synchronous introspection round trips
    pub query_timeout: Duration,

    /// First retry delay, doubled per attempt
    pub retry_base_delay: Duration,

    /// Upper bound of the retry delay
    pub retry_max_delay: Duration,

    /// Fail tasks deferred for an offline thing longer than this, wait forever when unset
    pub offline_task_ttl: Option<Duration>,
}

impl RunnerConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables, all optional:
    /// - THINGHUB_DISPATCH_INTERVAL_MS (default: 50)
    /// - THINGHUB_DISPATCH_PER_TICK (default: 10)
    /// - THINGHUB_RUNNER_POOL_SIZE (default: 500)
    /// - THINGHUB_QUERY_TIMEOUT_MS (default: 1000)
    /// - THINGHUB_RETRY_BASE_DELAY_MS (default: 500)
    /// - THINGHUB_RETRY_MAX_DELAY_MS (default: 30000)
    /// - THINGHUB_OFFLINE_TASK_TTL_SECS (default: unset)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            dispatch_interval: env_millis("THINGHUB_DISPATCH_INTERVAL_MS")?
                .unwrap_or(defaults.dispatch_interval),
            dispatch_per_tick: env_parse("THINGHUB_DISPATCH_PER_TICK")?
                .unwrap_or(defaults.dispatch_per_tick),
            pool_size: env_parse("THINGHUB_RUNNER_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            query_timeout: env_millis("THINGHUB_QUERY_TIMEOUT_MS")?
                .unwrap_or(defaults.query_timeout),
            retry_base_delay: env_millis("THINGHUB_RETRY_BASE_DELAY_MS")?
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_millis("THINGHUB_RETRY_MAX_DELAY_MS")?
                .unwrap_or(defaults.retry_max_delay),
            offline_task_ttl: env_parse::<u64>("THINGHUB_OFFLINE_TASK_TTL_SECS")?
                .map(Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_interval.is_zero() {
            anyhow::bail!("dispatch_interval must be greater than 0");
        }

        if self.dispatch_per_tick == 0 {
            anyhow::bail!("dispatch_per_tick must be greater than 0");
        }

        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if self.query_timeout.is_zero() {
            anyhow::bail!("query_timeout must be greater than 0");
        }

        if self.retry_base_delay > self.retry_max_delay {
            anyhow::bail!("retry_base_delay must not exceed retry_max_delay");
        }

        if self.offline_task_ttl.is_some_and(|ttl| ttl.is_zero()) {
            anyhow::bail!("offline_task_ttl must be greater than 0 when set");
        }

        Ok(())
    }

    /// Backoff before retry number `attempt` (zero based): base * 2^attempt, capped
    pub fn retry_delay(&self, attempt: u8) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(50),
            dispatch_per_tick: 10,
            pool_size: 500,
            query_timeout: Duration::from_secs(1),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            offline_task_ttl: None,
        }
    }
}

/// Reads an optional variable, failing on values that do not parse
pub fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(None),
    }
}

pub fn env_millis(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.dispatch_interval, Duration::from_millis(50));
        assert_eq!(config.dispatch_per_tick, 10);
        assert_eq!(config.pool_size, 500);
        assert!(config.offline_task_ttl.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = RunnerConfig::default();

        config.pool_size = 0;
        assert!(config.validate().is_err());
        config.pool_size = 1;

        config.dispatch_per_tick = 0;
        assert!(config.validate().is_err());
        config.dispatch_per_tick = 10;

        config.retry_base_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());
        config.retry_base_delay = Duration::from_millis(500);

        config.offline_task_ttl = Some(Duration::ZERO);
        assert!(config.validate().is_err());
        config.offline_task_ttl = Some(Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = RunnerConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(3), Duration::from_secs(4));
        assert_eq!(config.retry_delay(10), Duration::from_secs(30));
        assert_eq!(config.retry_delay(200), Duration::from_secs(30));
    }
}
