//! Configuration loading and management
//!
//! Two kinds of configuration feed the engine:
//! - the local application config, loaded from `~/.config/kitrelay/config.toml`
//! - the remote kit configuration snapshot, parsed per kit by [`kit`]
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/kitrelay/` (~/.config/kitrelay/)
//! - State/Logs: `$XDG_STATE_HOME/kitrelay/` (~/.local/state/kitrelay/)

pub mod kit;

pub use kit::{Bracketing, KitConfiguration, Settings};

use crate::error::{Error, Result};
use crate::types::KitId;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Fan-out engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Host values used when no live host is attached (CLI replay)
    #[serde(default)]
    pub host: HostConfig,
}

/// Fan-out engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Queue dispatch calls until the first kit configuration is applied
    #[serde(default = "default_queue_until_configured")]
    pub queue_until_configured: bool,

    /// Maximum number of calls held while waiting for configuration
    #[serde(default = "default_replay_queue_capacity")]
    pub replay_queue_capacity: usize,

    /// Buffer size of the activation/deactivation signal channel
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,

    /// Delimiter used when collapsing list attributes for kits without list support
    #[serde(default = "default_list_delimiter")]
    pub list_delimiter: String,

    /// Restrict the set of kit ids this runtime supports (all registered when unset)
    #[serde(default)]
    pub supported_kits: Option<Vec<KitId>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_until_configured: default_queue_until_configured(),
            replay_queue_capacity: default_replay_queue_capacity(),
            signal_capacity: default_signal_capacity(),
            list_delimiter: default_list_delimiter(),
            supported_kits: None,
        }
    }
}

impl EngineConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.replay_queue_capacity == 0 {
            return Err(Error::Config(
                "engine.replay_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.signal_capacity == 0 {
            return Err(Error::Config(
                "engine.signal_capacity must be at least 1".to_string(),
            ));
        }
        if self.list_delimiter.is_empty() {
            return Err(Error::Config(
                "engine.list_delimiter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_queue_until_configured() -> bool {
    true
}

fn default_replay_queue_capacity() -> usize {
    1000
}

fn default_signal_capacity() -> usize {
    64
}

fn default_list_delimiter() -> String {
    ",".to_string()
}

/// Static host values
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    /// User bucket (0-99) used for kit bracketing
    #[serde(default)]
    pub user_bucket: u8,

    /// Whether the user opted out of tracking
    #[serde(default)]
    pub opted_out: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.engine.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/kitrelay/config.toml` (~/.config/kitrelay/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("kitrelay").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/kitrelay/` (~/.local/state/kitrelay/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("kitrelay")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/kitrelay/kitrelay.log` (~/.local/state/kitrelay/kitrelay.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("kitrelay.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.engine.queue_until_configured);
        assert_eq!(config.engine.replay_queue_capacity, 1000);
        assert_eq!(config.engine.list_delimiter, ",");
        assert_eq!(config.logging.level, "info");
        assert!(config.engine.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[engine]
queue_until_configured = false
list_delimiter = "|"
supported_kits = [1, 2, 3]

[host]
user_bucket = 42

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(!config.engine.queue_until_configured);
        assert_eq!(config.engine.list_delimiter, "|");
        assert_eq!(config.engine.supported_kits, Some(vec![1, 2, 3]));
        assert_eq!(config.host.user_bucket, 42);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_engine_config_validation() {
        let config = EngineConfig {
            replay_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            list_delimiter: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nsignal_capacity = 8\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.engine.signal_capacity, 8);

        std::fs::write(&path, "[engine]\nsignal_capacity = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_log_path() {
        assert!(Config::log_path().ends_with("kitrelay.log"));
    }
}
