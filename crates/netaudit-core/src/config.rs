//! Configuration system for the audit sensor
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Smallest accepted ring buffer capacity in bytes
pub const MIN_LOG_CAPACITY: usize = 4096;

/// Ring buffer capacity used when nothing else is configured (1 MiB)
pub const DEFAULT_LOG_CAPACITY: usize = 1 << 20;

/// Default number of thread slots in the correlation table
pub const DEFAULT_MAX_THREADS: usize = 32768;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Audit log settings
    pub log: LogSettings,

    /// Probe category selection
    pub probes: ProbeSettings,

    /// Whitelisted (never recorded) activity
    pub whitelist: Vec<WhitelistRule>,
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Ring buffer size in bytes
    pub capacity: usize,

    /// Render records without the syslog prefix
    pub simple_format: bool,

    /// Return end-of-stream to readers that caught up instead of blocking
    pub send_eof: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            simple_format: false,
            send_eof: false,
        }
    }
}

/// Probe category selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub tcp_connect: bool,
    pub tcp_accept: bool,
    pub tcp_close: bool,
    pub udp_connect: bool,
    pub udp_bind: bool,
    pub udp_close: bool,

    /// Capacity of the per-thread correlation table
    pub max_threads: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            tcp_connect: true,
            tcp_accept: true,
            tcp_close: true,
            udp_connect: true,
            udp_bind: true,
            udp_close: true,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

/// One whitelist entry. Activity of `path` towards `address`/`port` is not
/// recorded; a missing address or port matches any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRule {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. NETAUDIT_CONFIG environment variable
    /// 3. ~/.config/netaudit/config.toml
    /// 4. /etc/netaudit/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Load and validate one specific file, without discovery or overrides
    pub fn load_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let config = self.load_from_file(path)?;
        self.validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("NETAUDIT_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("NETAUDIT_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/netaudit/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut SensorConfig) {
        if let Ok(val) = std::env::var("NETAUDIT_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("NETAUDIT_LOG_CAPACITY") {
            match val.parse() {
                Ok(capacity) => config.log.capacity = capacity,
                Err(_) => warn!(value = %val, "ignoring unparsable NETAUDIT_LOG_CAPACITY"),
            }
        }
        if let Ok(val) = std::env::var("NETAUDIT_SIMPLE_FORMAT") {
            config.log.simple_format = val.parse().unwrap_or(config.log.simple_format);
        }
        if let Ok(val) = std::env::var("NETAUDIT_SEND_EOF") {
            config.log.send_eof = val.parse().unwrap_or(config.log.send_eof);
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.log.capacity < MIN_LOG_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "Log capacity {} is below the minimum of {} bytes",
                config.log.capacity, MIN_LOG_CAPACITY
            )));
        }
        if config.log.capacity % 8 != 0 {
            return Err(ConfigError::ValidationError(format!(
                "Log capacity {} is not a multiple of 8",
                config.log.capacity
            )));
        }

        if config.probes.max_threads == 0 {
            return Err(ConfigError::ValidationError(
                "Thread table capacity cannot be 0".to_string(),
            ));
        }

        if let Some(rule) = config.whitelist.iter().find(|r| r.path.is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "Whitelist rule without a path: {:?}",
                rule
            )));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("netaudit").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SensorConfig::default();
        assert_eq!(config.sensor.log_level, "warn");
        assert_eq!(config.log.capacity, DEFAULT_LOG_CAPACITY);
        assert!(!config.log.simple_format);
        assert!(!config.log.send_eof);
        assert!(config.probes.tcp_connect);
        assert!(config.probes.udp_close);
        assert_eq!(config.probes.max_threads, DEFAULT_MAX_THREADS);
        assert!(config.whitelist.is_empty());
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "debug"
        "#;
        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "debug");
        assert!(config.probes.tcp_accept);
        assert_eq!(config.log.capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "trace"

            [log]
            capacity = 65536
            simple_format = true
            send_eof = true

            [probes]
            udp_bind = false
            max_threads = 1024

            [[whitelist]]
            path = "/usr/sbin/ntpd"

            [[whitelist]]
            path = "/usr/bin/curl"
            address = "10.0.0.1"
            port = 443
        "#;

        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "trace");
        assert_eq!(config.log.capacity, 65536);
        assert!(config.log.simple_format);
        assert!(config.log.send_eof);
        assert!(!config.probes.udp_bind);
        assert!(config.probes.tcp_connect);
        assert_eq!(config.probes.max_threads, 1024);
        assert_eq!(config.whitelist.len(), 2);
        assert_eq!(config.whitelist[0].address, None);
        assert_eq!(
            config.whitelist[1].address,
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(config.whitelist[1].port, Some(443));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SensorConfig {
            sensor: SensorSettings {
                log_level: "invalid".to_string(),
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_capacity() {
        let loader = ConfigLoader::new();

        let mut config = SensorConfig::default();
        config.log.capacity = 1024;
        assert!(loader.validate(&config).is_err());

        config.log.capacity = 4100;
        assert!(loader.validate(&config).is_err());

        config.log.capacity = 8192;
        assert!(loader.validate(&config).is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_whitelist_path() {
        let mut config = SensorConfig::default();
        config.whitelist.push(WhitelistRule {
            path: String::new(),
            address: None,
            port: Some(53),
        });
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_threads() {
        let mut config = SensorConfig::default();
        config.probes.max_threads = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SensorConfig::default();
        config.log.simple_format = true;
        config.whitelist.push(WhitelistRule {
            path: "/usr/bin/ssh".to_string(),
            address: None,
            port: Some(22),
        });

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();
        let loaded = loader.load_file(&path).unwrap();
        assert!(loaded.log.simple_format);
        assert_eq!(loaded.whitelist, config.whitelist);
    }

    #[test]
    fn test_load_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new().load_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_file_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[log\ncapacity = ").unwrap();
        let result = ConfigLoader::new().load_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_serialize_config() {
        let config = SensorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sensor]"));
        assert!(toml_str.contains("[log]"));
        assert!(toml_str.contains("capacity"));
    }
}
