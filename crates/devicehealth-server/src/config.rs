//! Configuration loading and validation for the device health server

use devicehealth::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid monitor configuration: {0}")]
    Monitor(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub devices: Vec<DeviceSettings>,

    #[serde(default)]
    pub time_sync: TimeSyncSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub channels: ChannelSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                let mut errors = ValidationErrors::new();
                errors.add("devices", ValidationError::new("duplicate_device_name"));
                return Err(errors);
            }
        }
        self.time_sync.validate()?;
        self.metrics.validate()?;
        self.channels.validate()?;
        Ok(())
    }
}

/// One monitored device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DeviceSettings {
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    #[validate(custom = "validate_host")]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Metrics requested from this device; monitor defaults when absent
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
}

impl DeviceSettings {
    /// Resolve the device address
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })
    }
}

/// Periodic broadcast time sync
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeSyncSettings {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_broadcast_interval")]
    pub broadcast_interval: Duration,

    #[validate(range(min = 1))]
    pub broadcast_port: u16,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

/// Channel buffer size settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ChannelSettings {
    /// Events buffered per subscriber before it starts lagging
    #[validate(range(min = 16, max = 1_000_000))]
    pub events: usize,
}

// Default implementations

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            broadcast_interval: Duration::from_secs(3600),
            broadcast_port: 5000,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9100".to_string(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            events: devicehealth::monitor::DEFAULT_EVENT_CAPACITY,
        }
    }
}

// Custom validators

fn validate_host(host: &str) -> Result<(), ValidationError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("host_empty"));
    }
    if trimmed.len() != host.len() || host.contains(char::is_whitespace) {
        return Err(ValidationError::new("host_invalid_format"));
    }
    Ok(())
}

fn validate_broadcast_interval(interval: &Duration) -> Result<(), ValidationError> {
    if *interval < Duration::from_secs(1) {
        return Err(ValidationError::new("broadcast_interval_too_short"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        config.monitor.validate().map_err(ConfigError::Monitor)?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/devicehealth/devicehealth.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./devicehealth.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/devicehealth/devicehealth.yaml"))
    }
}
