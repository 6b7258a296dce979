//! netdevd - network device activation daemon
//!
//! Wires a kernel backend and the device classes into a
//! [`netdev_core::DeviceManager`] and drives it:
//!
//! - [`config`]: TOML configuration with defaults and validation
//! - [`daemon`]: startup discovery, autoconnect, and the retry/reconcile loop

pub mod config;
pub mod daemon;

pub use config::{
    ConfigError, DaemonConfig, LoggingConfig, NetdevdConfig, PlatformBackend, PlatformConfig,
    DEFAULT_CONFIG_PATH,
};
pub use daemon::{build_platform, NetdevDaemon, StartupReport, TickReport};
