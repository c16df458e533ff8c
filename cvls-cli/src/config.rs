//! Configuration file support for cvls.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CVLS_*)
//! 3. Local config file (./cvls.toml)
//! 4. Global config file (~/.config/cvls/config.toml)

use clap::ValueEnum;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default transfer timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Protocol spoken over the TCP link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Framed binary protocol.
    #[default]
    Binary,
    /// Line-based text protocol.
    Text,
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unit address.
    pub host: Option<String>,
    /// Unit TCP port.
    pub tcp_port: Option<u16>,
    /// Serial port; selects the text protocol over RS-232.
    pub serial: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
    /// Protocol used over TCP.
    pub protocol: Option<Protocol>,
    /// Login user for the binary protocol.
    pub user: Option<String>,
    /// Login password for the binary protocol.
    pub password: Option<String>,
}

/// Transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Overall transfer timeout in seconds.
    pub timeout: Option<u64>,
    /// Reply window per page in milliseconds.
    pub reply_window_ms: Option<u64>,
    /// Consecutive misses tolerated on one page.
    pub max_missed_pages: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("cvls.toml")) {
            debug!("Loaded local config from cvls.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Failed to parse config file {}: {}", path.display(), e))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "cvls").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.host.is_some() {
            self.connection.host = conn.host;
        }
        if conn.tcp_port.is_some() {
            self.connection.tcp_port = conn.tcp_port;
        }
        if conn.serial.is_some() {
            self.connection.serial = conn.serial;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.protocol.is_some() {
            self.connection.protocol = conn.protocol;
        }
        if conn.user.is_some() {
            self.connection.user = conn.user;
        }
        if conn.password.is_some() {
            self.connection.password = conn.password;
        }

        let transfer = other.transfer;
        if transfer.timeout.is_some() {
            self.transfer.timeout = transfer.timeout;
        }
        if transfer.reply_window_ms.is_some() {
            self.transfer.reply_window_ms = transfer.reply_window_ms;
        }
        if transfer.max_missed_pages.is_some() {
            self.transfer.max_missed_pages = transfer.max_missed_pages;
        }
    }

    /// Engine settings with the configured overrides applied.
    pub fn engine_config(&self) -> cvls::EngineConfig {
        let mut engine = cvls::EngineConfig::default();
        if let Some(ms) = self.transfer.reply_window_ms {
            engine = engine.with_reply_window(Duration::from_millis(ms));
        }
        if let Some(max) = self.transfer.max_missed_pages {
            engine = engine.with_max_missed_pages(max);
        }
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.host.is_none());
        assert!(config.connection.serial.is_none());
        assert!(config.connection.protocol.is_none());
        assert!(config.transfer.timeout.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::parse(
            r#"
[connection]
host = "10.0.0.7"
tcp_port = 5001
protocol = "text"

[transfer]
timeout = 90
max_missed_pages = 8
"#,
        )
        .unwrap();

        assert_eq!(config.connection.host.as_deref(), Some("10.0.0.7"));
        assert_eq!(config.connection.tcp_port, Some(5001));
        assert_eq!(config.connection.protocol, Some(Protocol::Text));
        assert_eq!(config.transfer.timeout, Some(90));
        assert_eq!(config.engine_config().max_missed_pages, 8);
    }

    #[test]
    fn test_config_login() {
        let mut config =
            Config::parse("[connection]\nuser = \"admin\"\npassword = \"secret\"\n").unwrap();
        assert_eq!(config.connection.user.as_deref(), Some("admin"));

        let mut other = Config::default();
        other.connection.password = Some("changed".into());
        config.merge(other);
        assert_eq!(config.connection.user.as_deref(), Some("admin"));
        assert_eq!(config.connection.password.as_deref(), Some("changed"));
    }

    #[test]
    fn test_config_empty_toml() {
        let config = Config::parse("").unwrap();
        assert!(config.connection.host.is_none());
    }

    #[test]
    fn test_config_rejects_unknown_protocol() {
        assert!(Config::parse("[connection]\nprotocol = \"modbus\"\n").is_err());
    }

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.connection.host = Some("192.168.0.2".to_string());
        base.connection.baud = Some(9600);

        let mut other = Config::default();
        other.connection.host = Some("192.168.0.9".to_string());
        other.transfer.timeout = Some(10);

        base.merge(other);
        assert_eq!(base.connection.host.as_deref(), Some("192.168.0.9"));
        assert_eq!(base.connection.baud, Some(9600));
        assert_eq!(base.transfer.timeout, Some(10));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.connection.protocol = Some(Protocol::Text);

        base.merge(Config::default());
        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.protocol, Some(Protocol::Text));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.toml");
        fs::write(&path, "[connection]\nbaud = 57600\n").unwrap();
        assert_eq!(Config::load_from_path(&path).connection.baud, Some(57600));
    }

    #[test]
    fn test_load_from_invalid_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();
        assert!(Config::load_from_path(&path).connection.baud.is_none());
    }
}
