//! Configuration model and loading
//!
//! Configuration sources, highest priority first:
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`PLAYERKIT_CONFIG`)
//! 3. Platform config directory (`<config_dir>/playerkit/config.toml`)
//! 4. Built-in defaults
//!
//! A missing file never aborts startup: a warning is logged and the
//! built-in defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "PLAYERKIT_CONFIG";

/// Default EventBus capacity per Context
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default upper bound on simultaneously held engines
pub const DEFAULT_MAX_POOL_SIZE: usize = 4;

/// Default upper bound on idle engines kept per configuration fingerprint
pub const DEFAULT_MAX_PER_FINGERPRINT: usize = 2;

/// Default fraction of `max_per_fingerprint` below which auto-replenish kicks in
pub const DEFAULT_REPLENISH_THRESHOLD: f64 = 0.5;

/// What `acquire` does when the only entries matching a fingerprint are busy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusyMatchPolicy {
    /// Treat it as a miss and create another instance (subject to the max)
    #[default]
    CreateNew,
    /// Fail with pool exhaustion instead of duplicating the configuration
    Reject,
}

/// Engine pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on simultaneously held instances (idle + busy)
    pub max_pool_size: usize,

    /// Instances created eagerly when the pool is built
    pub prewarm_count: usize,

    /// Idle time after which an instance is torn down rather than reused
    ///
    /// Zero disables idle teardown.
    pub idle_timeout_ms: u64,

    /// Behaviour for fingerprints that only match busy entries
    pub busy_match_policy: BusyMatchPolicy,

    /// Idle instances kept per fingerprint; the oldest is evicted on overflow
    pub max_per_fingerprint: usize,

    /// Top a fingerprint back up after an acquire drains it
    pub auto_replenish: bool,

    /// Replenish when the idle count for a fingerprint drops below
    /// `floor(max_per_fingerprint * auto_replenish_threshold)`
    pub auto_replenish_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            prewarm_count: 0,
            idle_timeout_ms: 0,
            busy_match_policy: BusyMatchPolicy::default(),
            max_per_fingerprint: DEFAULT_MAX_PER_FINGERPRINT,
            auto_replenish: false,
            auto_replenish_threshold: DEFAULT_REPLENISH_THRESHOLD,
        }
    }
}

impl PoolConfig {
    /// Pool config with the given maximum and defaults elsewhere
    pub fn with_max_pool_size(max_pool_size: usize) -> Self {
        Self {
            max_pool_size,
            ..Self::default()
        }
    }

    /// Idle timeout as a duration, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| crate::time::millis_to_duration(self.idle_timeout_ms))
    }

    /// Idle count per fingerprint below which auto-replenish tops up
    pub fn replenish_floor(&self) -> usize {
        (self.max_per_fingerprint as f64 * self.auto_replenish_threshold).floor() as usize
    }

    /// Reject configurations the pool cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::Config("pool.max_pool_size must be at least 1".to_string()));
        }
        if self.max_per_fingerprint == 0 {
            return Err(Error::Config("pool.max_per_fingerprint must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.auto_replenish_threshold) {
            return Err(Error::Config(format!(
                "pool.auto_replenish_threshold ({}) must be between 0 and 1",
                self.auto_replenish_threshold
            )));
        }
        if self.prewarm_count > self.max_pool_size {
            return Err(Error::Config(format!(
                "pool.prewarm_count ({}) exceeds pool.max_pool_size ({})",
                self.prewarm_count, self.max_pool_size
            )));
        }
        Ok(())
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity per Context
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete PlayerKit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PlayerKitConfig {
    pub pool: PoolConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl PlayerKitConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PlayerKitConfig = toml::from_str(content)?;
        config.pool.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the highest-priority source, falling back to defaults
    ///
    /// A file that exists but fails to parse or validate is an error; a file
    /// that does not exist is not.
    pub fn load_or_default(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Resolve the config file path following the priority order:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. Platform config directory, if the file exists there
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|path| path.exists())
}

/// `<config_dir>/playerkit/config.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("playerkit").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerKitConfig::default();
        assert_eq!(config.pool.max_pool_size, 4);
        assert_eq!(config.pool.prewarm_count, 0);
        assert_eq!(config.pool.idle_timeout(), None);
        assert_eq!(config.pool.busy_match_policy, BusyMatchPolicy::CreateNew);
        assert_eq!(config.pool.max_per_fingerprint, 2);
        assert!(!config.pool.auto_replenish);
        assert_eq!(config.pool.replenish_floor(), 1);
        assert_eq!(config.events.capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = PlayerKitConfig::from_toml_str(
            r#"
            [pool]
            max_pool_size = 2
            idle_timeout_ms = 1500
            busy_match_policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_pool_size, 2);
        assert_eq!(config.pool.prewarm_count, 0);
        assert_eq!(config.pool.idle_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.pool.busy_match_policy, BusyMatchPolicy::Reject);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_validation_rejects_zero_max() {
        let err = PlayerKitConfig::from_toml_str("[pool]\nmax_pool_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_prewarm_over_max() {
        let config = PoolConfig {
            max_pool_size: 2,
            prewarm_count: 3,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PoolConfig::with_max_pool_size(3).validate().is_ok());
    }

    #[test]
    fn test_validation_of_per_fingerprint_settings() {
        let mut config = PoolConfig {
            max_per_fingerprint: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());

        config.max_per_fingerprint = 3;
        config.auto_replenish_threshold = 1.5;
        assert!(config.validate().is_err());
        config.auto_replenish_threshold = f64::NAN;
        assert!(config.validate().is_err());

        config.auto_replenish_threshold = 0.7;
        assert!(config.validate().is_ok());
        assert_eq!(config.replenish_floor(), 2);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = PlayerKitConfig::from_toml_str("[pool\nmax_pool_size = ").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_cli_argument_wins() {
        let cli = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(
            resolve_config_path(Some(&cli), "PLAYERKIT_TEST_UNSET_VAR"),
            Some(cli)
        );
    }
}
