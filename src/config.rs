//! Configuration management for nodeplane.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeplane/config.toml";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal", "panic"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Local port range managed by the allocator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port of the range (inclusive).
    pub start: u16,

    /// Last port of the range (inclusive).
    pub end: u16,

    /// Keep the probe socket bound until the port is released.
    pub hold_sockets: bool,

    /// Record OS-bound ports in the range as system-owned at startup.
    pub scan_on_startup: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: 10000,
            end: 20000,
            hold_sockets: false,
            scan_on_startup: false,
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start == 0 {
            return Err(ConfigError::ValidationError(format!(
                "invalid start port: {}",
                self.start
            )));
        }
        if self.end == 0 {
            return Err(ConfigError::ValidationError(format!(
                "invalid end port: {}",
                self.end
            )));
        }
        if self.start > self.end {
            return Err(ConfigError::ValidationError(format!(
                "start port {} cannot be greater than end port {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        usize::from(self.end) - usize::from(self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/nodeplane/nodeplane.db"),
        }
    }
}

/// Node agent synchronisation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Seconds between user reconciliation cycles.
    pub pull_interval_secs: u64,

    /// Seconds between traffic drain cycles.
    pub push_interval_secs: u64,

    /// Per-request timeout for agent calls.
    pub request_timeout_secs: u64,

    /// Agent port used when a node has no explicit agent URL.
    pub agent_port: u16,

    /// Bearer token used when a node has no token of its own.
    pub agent_token: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pull_interval_secs: 60,
            push_interval_secs: 60,
            request_timeout_secs: 30,
            agent_port: 9000,
            agent_token: None,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pull_interval_secs == 0 || self.push_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync intervals must be at least 1 second".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > 300 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be between 1 and 300".to_string(),
            ));
        }
        if self.agent_port == 0 {
            return Err(ConfigError::ValidationError(
                "agent_port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Engine config generation defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Port of the local mixed inbound.
    pub local_port: u16,

    /// Engine log level.
    pub log_level: String,

    pub enable_dns: bool,

    pub enable_route: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            local_port: 7890,
            log_level: "info".to_string(),
            enable_dns: true,
            enable_route: true,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_port == 0 {
            return Err(ConfigError::ValidationError(
                "generator.local_port must be non-zero".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown engine log level: {}",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Subscription endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Value of the profile-update-interval header, in hours.
    pub update_interval_hours: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            update_interval_hours: 24,
        }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub ports: PortConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub node: NodeConfig,
    pub generator: GeneratorConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ports.validate()?;
        self.node.validate()?;
        self.generator.validate()?;
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}
