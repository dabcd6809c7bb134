//! Configuration management for DirectShare.
//!
//! This module handles loading, saving, and managing DirectShare configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/directshare/config.toml` |
//! | macOS | `~/Library/Application Support/com.directshare.DirectShare/config.toml` |
//! | Windows | `%APPDATA%\DirectShare\DirectShare\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use directshare_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for DirectShare.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name announced to other peers
    pub device_name: String,
    /// Directory where received files are saved
    pub download_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(std::path::Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("DirectShare");

        Self {
            device_name: hostname::get().map_or_else(
                |_| "Unknown".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            download_dir,
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery port (UDP)
    pub discovery_port: u16,
    /// Transfer and handshake port (TCP)
    pub transfer_port: u16,
    /// Multicast group joined by the discovery socket
    pub multicast_group: Ipv4Addr,
    /// Destination address for announcements
    pub announce_address: Ipv4Addr,
    /// Service name peers must share to see each other
    pub service_name: String,
    /// Interval between self-announcements
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,
    /// How long `join_group` waits for the TCP connect
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long an accepted socket may take to send its JOIN message
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Address advertised to peers; detected from the routing table when unset
    pub local_address: Option<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: crate::DEFAULT_DISCOVERY_PORT,
            transfer_port: crate::DEFAULT_TRANSFER_PORT,
            multicast_group: crate::DEFAULT_MULTICAST_GROUP,
            announce_address: Ipv4Addr::BROADCAST,
            service_name: crate::SERVICE_NAME.to_string(),
            announce_interval: Duration::from_secs(crate::DEFAULT_ANNOUNCE_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            local_address: None,
        }
    }
}

impl NetworkConfig {
    /// Address announcements are sent to.
    #[must_use]
    pub fn announce_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.announce_address, self.discovery_port))
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for transfers
    pub chunk_size: usize,
    /// Number of transfers allowed to run at once
    pub max_concurrent_transfers: usize,
    /// Idle timeout applied to every read and write
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Maximum time between progress notifications
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrent_transfers: crate::DEFAULT_MAX_CONCURRENT_TRANSFERS,
            io_timeout: Duration::from_secs(crate::DEFAULT_IO_TIMEOUT_SECS),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigError(format!("Failed to create config directory: {e}")))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "directshare", "DirectShare")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Whole seconds as `"5s"`, anything finer as `"1500ms"`.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid duration {s:?}, expected e.g. \"500ms\", \"5s\" or \"5m\""))
        })
    }

    pub(super) fn parse(s: &str) -> Option<Duration> {
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse().ok().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse().ok().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.discovery_port, 8888);
        assert_eq!(config.network.transfer_port, 8889);
        assert_eq!(config.network.multicast_group, Ipv4Addr::new(230, 0, 0, 1));
        assert_eq!(config.network.service_name, "WiFiDirectFileShare");
        assert_eq!(config.network.announce_interval, Duration::from_secs(5));
        assert_eq!(config.transfer.chunk_size, 128 * 1024);
        assert_eq!(config.transfer.max_concurrent_transfers, 4);
        assert_eq!(config.transfer.io_timeout, Duration::from_secs(300));
        assert_eq!(config.transfer.progress_interval, Duration::from_millis(100));
        assert!(!config.general.device_name.is_empty());
    }

    #[test]
    fn test_announce_target() {
        let config = Config::default();
        assert_eq!(
            config.network.announce_target(),
            "255.255.255.255:8888".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.general.device_name = "bench-laptop".to_string();
        config.network.local_address = Some(Ipv4Addr::new(192, 168, 1, 40));
        config.transfer.max_concurrent_transfers = 2;
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.general.device_name, "bench-laptop");
        assert_eq!(loaded.network.local_address, Some(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(loaded.transfer.max_concurrent_transfers, 2);
        assert_eq!(loaded.transfer.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_sub_second_timeouts_survive_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.network.connect_timeout = Duration::from_millis(250);
        config.network.handshake_timeout = Duration::from_millis(1500);
        config.transfer.io_timeout = Duration::from_millis(100);
        config.save_to(&path).expect("save");

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("connect_timeout = \"250ms\""));
        assert!(written.contains("announce_interval = \"5s\""));

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.network.connect_timeout, Duration::from_millis(250));
        assert_eq!(loaded.network.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(loaded.transfer.io_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_duration_formats() {
        assert_eq!(humantime_serde::parse("750ms"), Some(Duration::from_millis(750)));
        assert_eq!(humantime_serde::parse("30s"), Some(Duration::from_secs(30)));
        assert_eq!(humantime_serde::parse("2m"), Some(Duration::from_secs(120)));
        assert_eq!(humantime_serde::parse("soon"), None);
        assert_eq!(humantime_serde::parse("5"), None);
    }

    #[test]
    fn test_config_deserialization_partial() {
        let toml_str = r#"
[network]
discovery_port = 9999
announce_interval = "2m"
"#;

        let config: Config = toml::from_str(toml_str).expect("deserialize");
        assert_eq!(config.network.discovery_port, 9999);
        assert_eq!(config.network.announce_interval, Duration::from_secs(120));
        assert_eq!(config.network.transfer_port, 8889);
        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.network.discovery_port, crate::DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network\ndiscovery_port = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }
}
