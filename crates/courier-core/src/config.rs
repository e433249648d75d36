//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::app::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Retry/backoff for transient delivery failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per message, first try included (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.0..=1.0.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a push waits on a full queue before dropping the oldest item.
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Seen ids older than this are forgotten. Unset means capacity-bound only.
    #[serde(default)]
    pub dedup_retention_secs: Option<u64>,
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            dedup_capacity: default_dedup_capacity(),
            dedup_retention_secs: None,
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl IntakeConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn dedup_retention(&self) -> Option<Duration> {
        self.dedup_retention_secs.map(Duration::from_secs)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_push_timeout_ms() -> u64 {
    250
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_resubscribe_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent sends per task.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Auto-pause once permanent failures inside the window exceed this.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            failure_window_secs: default_failure_window_secs(),
            failure_threshold: default_failure_threshold(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn default_max_in_flight() -> usize {
    4
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_failure_threshold() -> usize {
    5
}

fn default_cancel_grace_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Pending writes above this flag the collector as lagging.
    #[serde(default = "default_lag_threshold")]
    pub lag_threshold: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            lag_threshold: default_lag_threshold(),
        }
    }
}

fn default_lag_threshold() -> usize {
    10_000
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within 0.0..=1.0");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.intake.queue_capacity == 0 {
            return invalid("intake.queue_capacity must be at least 1");
        }
        if self.intake.dedup_capacity == 0 {
            return invalid("intake.dedup_capacity must be at least 1");
        }
        if self.dispatch.max_in_flight == 0 {
            return invalid("dispatch.max_in_flight must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.dispatch.cancel_grace(), Duration::from_secs(3));
        assert_eq!(config.intake.dedup_retention(), None);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 5
            jitter = 0.0

            [intake]
            dedup_retention_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(
            config.intake.dedup_retention(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.intake.queue_capacity, 256);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = EngineConfig::from_toml_str("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_jitter_is_rejected() {
        let err = EngineConfig::from_toml_str("[retry]\njitter = 1.5").unwrap_err();
        assert!(err.to_string().contains("jitter"));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[dispatch]\nmax_in_flight = 1\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.dispatch.max_in_flight, 1);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
