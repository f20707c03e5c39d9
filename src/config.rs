//! Engine configuration.
//!
//! Every timeout and threshold in the engine is configurable through
//! environment variables, with defaults matching a small single-region
//! deployment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::autoscaler::AutoscalerConfig;
use crate::dispatch::{AutoRetry, DispatcherConfig};
use crate::monitor::MonitorConfig;
use crate::sweeper::SweeperConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the whole orchestration engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL for the dispatch queues.
    pub redis_url: String,
    /// Address the HTTP API binds to.
    pub bind_addr: String,
    /// Key prefix for the per-class dispatch queues.
    pub queue_prefix: String,
    /// Replica count reported for classes the pool has never scaled.
    pub initial_replicas: u32,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Heartbeat monitor settings.
    pub monitor: MonitorConfig,
    /// Cleanup sweeper settings.
    pub sweeper: SweeperConfig,
    /// Autoscaler settings.
    pub autoscaler: AutoscalerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/waveflow".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            queue_prefix: "waveflow:dispatch".to_string(),
            initial_replicas: 1,
            dispatcher: DispatcherConfig::default(),
            monitor: MonitorConfig::default(),
            sweeper: SweeperConfig::default(),
            autoscaler: AutoscalerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `REDIS_URL`: Redis connection URL
    /// - `WAVEFLOW_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
    /// - `WAVEFLOW_QUEUE_PREFIX`: dispatch queue key prefix
    /// - `WAVEFLOW_INITIAL_REPLICAS`: default replica count (default: 1)
    /// - `WAVEFLOW_MAX_RETRIES`: automatic retries per request (default: 3)
    /// - `WAVEFLOW_MAX_DISPATCH_RETRIES`: enqueue attempts (default: 3)
    /// - `WAVEFLOW_DISPATCH_BACKOFF_SECS`: base redelivery delay (default: 2)
    /// - `WAVEFLOW_AUTO_RETRY_ANALYSIS` / `_GENERATION` / `_TRAINING`:
    ///   per-class automatic retry flags
    /// - `WAVEFLOW_MONITOR_INTERVAL_SECS`: staleness sweep interval (default: 60)
    /// - `WAVEFLOW_STALE_TIMEOUT_SECS`: heartbeat silence budget (default: 1800)
    /// - `WAVEFLOW_SWEEP_INTERVAL_SECS`: cleanup sweep interval (default: 30)
    /// - `WAVEFLOW_COMPLETION_GRACE_SECS`: completed-job visibility (default: 30)
    /// - `WAVEFLOW_RETENTION_SECS`: failed/cancelled retention (default: 7 days)
    /// - `WAVEFLOW_POLL_INTERVAL_SECS`: autoscaler tick interval (default: 10)
    /// - `WAVEFLOW_COOLDOWN_SECS`: autoscaler cooldown (default: 120)
    /// - `WAVEFLOW_SCALE_UP_THRESHOLD` / `WAVEFLOW_SCALE_DOWN_THRESHOLD`
    /// - `WAVEFLOW_MIN_WORKERS` / `WAVEFLOW_MAX_WORKERS`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration is unstable (no hysteresis gap).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(addr) = std::env::var("WAVEFLOW_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(prefix) = std::env::var("WAVEFLOW_QUEUE_PREFIX") {
            config.queue_prefix = prefix;
        }

        config.initial_replicas = parse_env("WAVEFLOW_INITIAL_REPLICAS", config.initial_replicas)?;

        config.dispatcher.max_retries =
            parse_env("WAVEFLOW_MAX_RETRIES", config.dispatcher.max_retries)?;
        config.dispatcher.max_dispatch_retries = parse_env(
            "WAVEFLOW_MAX_DISPATCH_RETRIES",
            config.dispatcher.max_dispatch_retries,
        )?;
        config.dispatcher.dispatch_backoff = parse_env_secs(
            "WAVEFLOW_DISPATCH_BACKOFF_SECS",
            config.dispatcher.dispatch_backoff,
        )?;
        config.dispatcher.auto_retry = AutoRetry {
            analysis: parse_env(
                "WAVEFLOW_AUTO_RETRY_ANALYSIS",
                config.dispatcher.auto_retry.analysis,
            )?,
            generation: parse_env(
                "WAVEFLOW_AUTO_RETRY_GENERATION",
                config.dispatcher.auto_retry.generation,
            )?,
            training: parse_env(
                "WAVEFLOW_AUTO_RETRY_TRAINING",
                config.dispatcher.auto_retry.training,
            )?,
        };

        config.monitor.interval =
            parse_env_secs("WAVEFLOW_MONITOR_INTERVAL_SECS", config.monitor.interval)?;
        config.monitor.stale_timeout =
            parse_env_secs("WAVEFLOW_STALE_TIMEOUT_SECS", config.monitor.stale_timeout)?;

        config.sweeper.interval =
            parse_env_secs("WAVEFLOW_SWEEP_INTERVAL_SECS", config.sweeper.interval)?;
        config.sweeper.completion_grace_period = parse_env_secs(
            "WAVEFLOW_COMPLETION_GRACE_SECS",
            config.sweeper.completion_grace_period,
        )?;
        config.sweeper.retention_period =
            parse_env_secs("WAVEFLOW_RETENTION_SECS", config.sweeper.retention_period)?;

        config.autoscaler.poll_interval =
            parse_env_secs("WAVEFLOW_POLL_INTERVAL_SECS", config.autoscaler.poll_interval)?;
        config.autoscaler.cooldown =
            parse_env_secs("WAVEFLOW_COOLDOWN_SECS", config.autoscaler.cooldown)?;
        config.autoscaler.scale_up_threshold = parse_env(
            "WAVEFLOW_SCALE_UP_THRESHOLD",
            config.autoscaler.scale_up_threshold,
        )?;
        config.autoscaler.scale_down_threshold = parse_env(
            "WAVEFLOW_SCALE_DOWN_THRESHOLD",
            config.autoscaler.scale_down_threshold,
        )?;
        config.autoscaler.min_workers =
            parse_env("WAVEFLOW_MIN_WORKERS", config.autoscaler.min_workers)?;
        config.autoscaler.max_workers =
            parse_env("WAVEFLOW_MAX_WORKERS", config.autoscaler.max_workers)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.autoscaler
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        if self.dispatcher.max_dispatch_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_dispatch_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_env(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.stale_timeout, Duration::from_secs(1800));
        assert_eq!(
            config.sweeper.completion_grace_period,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.sweeper.retention_period,
            Duration::from_secs(7 * 24 * 60 * 60)
        );
    }

    #[test]
    fn test_parse_env_uses_default_when_unset() {
        let value: u32 = parse_env("WAVEFLOW_TEST_UNSET_VAR", 7).expect("default");
        assert_eq!(value, 7);
    }

    #[test]
    fn test_parse_env_reads_and_validates() {
        std::env::set_var("WAVEFLOW_TEST_PARSE_VAR", "42");
        let value: u32 = parse_env("WAVEFLOW_TEST_PARSE_VAR", 7).expect("parsed");
        assert_eq!(value, 42);

        std::env::set_var("WAVEFLOW_TEST_PARSE_VAR_BAD", "not-a-number");
        let result: Result<u32, _> = parse_env("WAVEFLOW_TEST_PARSE_VAR_BAD", 7);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation_catches_missing_hysteresis_gap() {
        let mut config = OrchestratorConfig::default();
        config.autoscaler.scale_up_threshold = 1;
        config.autoscaler.scale_down_threshold = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_requires_dispatch_attempts() {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.max_dispatch_retries = 0;
        assert!(config.validate().is_err());
    }
}
