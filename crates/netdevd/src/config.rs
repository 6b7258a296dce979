//! Configuration file support for netdevd
//!
//! Loads and validates the daemon configuration from a TOML file.
//! Default location: /etc/netdevd/netdevd.toml

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netdev_core::ConnectionProfile;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netdevd/netdevd.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `netdev_bond=debug,info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

/// Kernel backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformBackend {
    /// iproute2 and the bonding sysfs tree
    #[default]
    Linux,
    /// Simulated kernel; nothing on the host is touched
    Memory,
}

/// Platform configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Backend used for link operations
    #[serde(default)]
    pub backend: PlatformBackend,

    /// Alternative sysfs mount point for the Linux backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysfs_root: Option<PathBuf>,
}

/// Controller loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Interval between retry passes over postponed and queued activations
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Interval between reconciliation passes; 0 disables reconciliation
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Take existing kernel links under management at startup
    #[serde(default = "default_discover_existing")]
    pub discover_existing: bool,
}

/// Complete netdevd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetdevdConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Platform configuration
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Controller loop configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Connection profiles available for autoconnect
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
}

// Default functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_discover_existing() -> bool {
    true
}

// Default implementations
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            discover_existing: default_discover_existing(),
        }
    }
}

impl DaemonConfig {
    /// Get retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Get reconcile interval as Duration, `None` when disabled
    pub fn reconcile_interval(&self) -> Option<Duration> {
        match self.reconcile_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl NetdevdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry_interval_ms must be > 0".to_string(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging level is empty".to_string()));
        }

        let mut interfaces = HashSet::new();
        for profile in &self.profiles {
            profile
                .verify()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;

            let iface = profile.interface_name().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "profile '{}' has no interface-name",
                    profile.id()
                ))
            })?;
            if profile.connection.autoconnect && !interfaces.insert(iface) {
                return Err(ConfigError::Invalid(format!(
                    "more than one autoconnect profile for interface '{}'",
                    iface
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[logging]
level = "debug"

[platform]
backend = "memory"

[daemon]
reconcile_interval_secs = 0

[[profiles]]
[profiles.connection]
id = "bond0"
type = "bond"
interface-name = "bond0"
[profiles.bond.options]
mode = "active-backup"
primary = "eth0"
[profiles.ip]
method = "disabled"

[[profiles]]
[profiles.connection]
id = "eth0"
type = "802-3-ethernet"
interface-name = "eth0"
master = "bond0"
slave-type = "bond"
"#;

    #[test]
    fn test_default_config() {
        let config = NetdevdConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.platform.backend, PlatformBackend::Linux);
        assert_eq!(config.daemon.retry_interval(), Duration::from_secs(1));
        assert_eq!(
            config.daemon.reconcile_interval(),
            Some(Duration::from_secs(30))
        );
        assert!(config.daemon.discover_existing);
        assert!(config.profiles.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let config = NetdevdConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.platform.backend, PlatformBackend::Memory);
        assert_eq!(config.daemon.reconcile_interval(), None);
        // Unspecified values should use defaults
        assert_eq!(config.daemon.retry_interval_ms, 1000);

        assert_eq!(config.profiles.len(), 2);
        let bond = &config.profiles[0];
        assert_eq!(bond.interface_name(), Some("bond0"));
        assert_eq!(
            bond.bond.as_ref().and_then(|b| b.get("primary")),
            Some("eth0")
        );
        assert!(!bond.connection.uuid.is_empty());
        assert_eq!(config.profiles[1].master(), Some("bond0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_retry_interval() {
        let mut config = NetdevdConfig::default();
        config.daemon.retry_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_duplicate_interface() {
        let mut config = NetdevdConfig::from_toml(SAMPLE).unwrap();
        let mut duplicate = config.profiles[0].clone();
        duplicate.connection.id = "bond0-copy".to_string();
        duplicate.connection.uuid = "5b2c6f3e-0c0e-4a8e-9d43-2f7f4c1f0a11".to_string();
        config.profiles.push(duplicate.clone());
        assert!(config.validate().is_err());

        config.profiles.last_mut().unwrap().connection.autoconnect = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_profile_without_interface() {
        let mut config = NetdevdConfig::default();
        config
            .profiles
            .push(ConnectionProfile::new("orphan", "bond"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = NetdevdConfig::load_or_default("/nonexistent/netdevd.toml").unwrap();
        assert_eq!(config, NetdevdConfig::default());
    }

    #[test]
    fn test_load_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netdevd.toml");
        fs::write(&path, "[daemon]\nretry_interval_ms = \"soon\"\n").unwrap();

        let err = NetdevdConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("netdevd.toml"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netdevd.toml");
        let config = NetdevdConfig::from_toml(SAMPLE).unwrap();

        config.save(&path).unwrap();
        let reloaded = NetdevdConfig::load_or_default(&path).unwrap();

        assert_eq!(reloaded, config);
    }
}
