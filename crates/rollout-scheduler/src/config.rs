//! Scheduler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Longest a job may be paused, in seconds.
    #[serde(default = "default_max_pause")]
    pub max_pause_secs: u64,
    /// Base of the cooldown after repeated failures, in seconds.
    #[serde(default = "default_cooldown_base")]
    pub cooldown_base_secs: u64,
    /// How far ahead to look for the end of block windows, in seconds.
    #[serde(default = "default_block_window_horizon")]
    pub block_window_horizon_secs: u64,
    /// Granularity of the block window search, in seconds.
    #[serde(default = "default_block_window_step")]
    pub block_window_step_secs: u64,
    /// Interval between sweeps for ready jobs, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_pause() -> u64 {
    3 * 24 * 3600
}

fn default_cooldown_base() -> u64 {
    10 * 60
}

fn default_block_window_horizon() -> u64 {
    7 * 24 * 3600
}

fn default_block_window_step() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pause_secs: default_max_pause(),
            cooldown_base_secs: default_cooldown_base(),
            block_window_horizon_secs: default_block_window_horizon(),
            block_window_step_secs: default_block_window_step(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl From<ConfigError> for rollout_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(err) => rollout_core::Error::Io(err),
            other => rollout_core::Error::InvalidArgument(other.to_string()),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_window_step_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "block_window_step_secs",
                message: "must be positive".to_string(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_secs",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_max_pause(mut self, max_pause: Duration) -> Self {
        self.max_pause_secs = seconds(max_pause);
        self
    }

    pub fn with_cooldown_base(mut self, cooldown_base: Duration) -> Self {
        self.cooldown_base_secs = seconds(cooldown_base);
        self
    }

    pub fn with_block_window_horizon(mut self, horizon: Duration) -> Self {
        self.block_window_horizon_secs = seconds(horizon);
        self
    }

    pub fn with_sweep_interval(mut self, interval: std::time::Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn max_pause(&self) -> Duration {
        duration(self.max_pause_secs)
    }

    pub fn cooldown_base(&self) -> Duration {
        duration(self.cooldown_base_secs)
    }

    pub fn block_window_horizon(&self) -> Duration {
        duration(self.block_window_horizon_secs)
    }

    pub fn block_window_step(&self) -> Duration {
        duration(self.block_window_step_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

fn duration(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

fn seconds(duration: Duration) -> u64 {
    u64::try_from(duration.num_seconds()).unwrap_or(0)
}
