//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__LIMITER__CAPACITY`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Token bucket limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Overload detector configuration
    #[serde(default)]
    pub overload: OverloadConfig,
}

/// Token bucket limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum requests per client per refill interval
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Refill interval in milliseconds
    #[serde(default = "default_refill_interval")]
    pub refill_interval_ms: u64,

    /// Number of independently locked partitions of the bucket map
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval(),
            shards: default_shards(),
        }
    }
}

impl LimiterConfig {
    /// The refill interval as a duration.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

fn default_capacity() -> u32 {
    1000
}

fn default_refill_interval() -> u64 {
    1000
}

fn default_shards() -> usize {
    64
}

/// Overload detector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverloadConfig {
    /// Sampling period in milliseconds
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Time between samples beyond which the process counts as overloaded
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold_ms: u64,
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            overload_threshold_ms: default_overload_threshold(),
        }
    }
}

impl OverloadConfig {
    /// The sampling period as a duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// The overload threshold as a duration.
    pub fn overload_threshold(&self) -> Duration {
        Duration::from_millis(self.overload_threshold_ms)
    }
}

fn default_check_interval() -> u64 {
    100
}

fn default_overload_threshold() -> u64 {
    200
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// The file format is picked from its extension (YAML, TOML or JSON).
    /// Environment variables override file values, using `__` as the
    /// nesting separator: `TOLLGATE__OVERLOAD__CHECK_INTERVAL_MS=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every value against the constraints of the primitives.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.capacity == 0 {
            return Err(TollgateError::Config(
                "limiter.capacity must be positive".to_string(),
            ));
        }
        if self.limiter.refill_interval_ms == 0 {
            return Err(TollgateError::Config(
                "limiter.refill_interval_ms must be positive".to_string(),
            ));
        }
        if self.limiter.shards < 2 || !self.limiter.shards.is_power_of_two() {
            return Err(TollgateError::Config(format!(
                "limiter.shards must be a power of two greater than 1, got {}",
                self.limiter.shards
            )));
        }
        if self.overload.check_interval_ms == 0 {
            return Err(TollgateError::Config(
                "overload.check_interval_ms must be positive".to_string(),
            ));
        }
        if self.overload.overload_threshold_ms <= self.overload.check_interval_ms {
            return Err(TollgateError::Config(format!(
                "overload.overload_threshold_ms ({}) must exceed overload.check_interval_ms ({})",
                self.overload.overload_threshold_ms, self.overload.check_interval_ms
            )));
        }
        Ok(())
    }
}
