//! Runtime configuration loaded from a JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::default_database_path;

/// Environment variable naming the config file when none is passed.
pub const CONFIG_ENV_VAR: &str = "USSDQ_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Also attempt a claim whenever the store reports a change.
    #[serde(default)]
    pub dispatch_on_change: bool,
    #[serde(default = "default_change_watch_interval_ms")]
    pub change_watch_interval_ms: u64,
    #[serde(default)]
    pub simulated: SimulatedConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_execution_timeout_secs() -> u64 {
    45
}

fn default_change_watch_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            execution_timeout_secs: default_execution_timeout_secs(),
            dispatch_on_change: false,
            change_watch_interval_ms: default_change_watch_interval_ms(),
            simulated: SimulatedConfig::default(),
            modem: ModemConfig::default(),
            observer: ObserverConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn change_watch_interval(&self) -> Duration {
        Duration::from_millis(self.change_watch_interval_ms)
    }

    /// The configured database path, or the per-user default.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path().ok_or(ConfigError::NoDatabasePath),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    #[serde(default = "default_simulated_delay_ms")]
    pub delay_ms: u64,
}

fn default_simulated_delay_ms() -> u64 {
    1500
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_simulated_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Serial device per SIM slot, e.g. `{"1": "/dev/ttyUSB2"}`.
    #[serde(default)]
    pub ports: BTreeMap<u32, PathBuf>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            ports: BTreeMap::new(),
            baud_rate: default_baud_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_resubscribe_initial_ms")]
    pub resubscribe_initial_ms: u64,
    #[serde(default = "default_resubscribe_max_ms")]
    pub resubscribe_max_ms: u64,
}

fn default_resubscribe_initial_ms() -> u64 {
    500
}

fn default_resubscribe_max_ms() -> u64 {
    30_000
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial_ms: default_resubscribe_initial_ms(),
            resubscribe_max_ms: default_resubscribe_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Loads the config from `path`, else from `$USSDQ_CONFIG`, else defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return load_config(path);
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => load_config(PathBuf::from(path)),
        _ => Ok(Config::default()),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    for (name, value) in [
        ("poll_interval_ms", config.poll_interval_ms),
        ("execution_timeout_secs", config.execution_timeout_secs),
        ("change_watch_interval_ms", config.change_watch_interval_ms),
        ("observer.resubscribe_initial_ms", config.observer.resubscribe_initial_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than zero", name),
            });
        }
    }

    if config.observer.resubscribe_initial_ms > config.observer.resubscribe_max_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "observer.resubscribe_initial_ms ({}) exceeds resubscribe_max_ms ({})",
                config.observer.resubscribe_initial_ms, config.observer.resubscribe_max_ms
            ),
        });
    }

    Ok(())
}
