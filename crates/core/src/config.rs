// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The explicit, immutable configuration value tree (spec.md §6, §9).
//!
//! Loaded once from TOML at daemon startup (grounded on
//! `crates/daemon/src/lifecycle.rs`'s `Config::load()` state-directory
//! resolution) and passed down as `Arc<Config>`. Runtime reconfiguration goes
//! through a component's `Configure` method, which takes the entire next
//! value and swaps it atomically — never a partial patch (spec.md §9).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "duration_secs")]
    pub autoscale_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            autoscale_interval: secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigDefaults {
    #[serde(with = "duration_secs")]
    pub max_idle: Duration,
    #[serde(with = "duration_secs")]
    pub max_lifetime: Duration,
}

impl Default for SessionConfigDefaults {
    fn default() -> Self {
        Self {
            max_idle: secs(600),
            max_lifetime: secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(with = "duration_secs")]
    pub graceful_deadline: Duration,
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,
    pub health_failure_budget: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_deadline: secs(10),
            health_interval: secs(30),
            health_failure_budget: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    #[serde(with = "duration_millis")]
    pub stall_deadline: Duration,
    pub max_line_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            stall_deadline: millis(500),
            max_line_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u64,
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    pub success_threshold: u64,
    pub request_volume_threshold: u64,
    pub error_percentage_threshold: f64,
    pub half_open_max_calls: u64,
    #[serde(with = "duration_secs")]
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: secs(30),
            success_threshold: 2,
            request_volume_threshold: 10,
            error_percentage_threshold: 50.0,
            half_open_max_calls: 1,
            rolling_window: secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_restarts: u32,
    #[serde(with = "duration_secs")]
    pub restart_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_interval: secs(300),
            max_backoff: secs(60),
            base_delay: millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultBackpressurePolicy {
    DropOldest,
    DropNewest,
    #[default]
    Block,
    CloseOnOverflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub default_buffer: usize,
    pub default_policy: DefaultBackpressurePolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            default_buffer: 256,
            default_policy: DefaultBackpressurePolicy::Block,
        }
    }
}

/// The full configuration surface enumerated in spec.md §6, loaded as one
/// immutable value tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub session: SessionConfigDefaults,
    pub supervisor: SupervisorConfig,
    pub pipeline: PipelineConfig,
    pub breaker: BreakerConfig,
    pub recovery: RecoveryConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Default state directory: `~/.relay`, overridable by `RELAY_CONFIG_DIR`
    /// — generalises `watcher.rs`'s `CLAUDE_CONFIG_DIR`-style override.
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("RELAY_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
    }

    pub fn config_path() -> PathBuf {
        Self::state_dir().join("config.toml")
    }

    /// Load config from `path`, falling back to defaults if the file is
    /// absent (matching the teacher's no-config-file-yet startup path).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(ConfigError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.scale_up_threshold, 0.8);
        assert_eq!(config.pool.scale_down_threshold, 0.3);
        assert_eq!(config.pipeline.buffer_size, 1024);
        assert_eq!(config.pipeline.max_line_bytes, 1024 * 1024);
        assert_eq!(config.pipeline.stall_deadline, millis(500));
        assert_eq!(config.supervisor.health_failure_budget, 3);
    }

    #[test]
    fn load_from_missing_path_returns_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/relay/config.toml")).expect("load");
        assert_eq!(config.pool.min_size, 1);
    }

    #[test]
    fn load_from_toml_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pool]\nmax_size = 16\n").expect("write");
        let config = Config::load_from(&path).expect("load");
        assert_eq!(config.pool.max_size, 16);
        assert_eq!(config.pool.min_size, 1, "unspecified fields keep their default");
    }

    #[test]
    fn state_dir_honours_env_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("RELAY_CONFIG_DIR", dir.path());
        assert_eq!(Config::state_dir(), dir.path());
        std::env::remove_var("RELAY_CONFIG_DIR");
    }
}
