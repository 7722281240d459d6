//! Configuration management for AnyDrop.
//!
//! This module handles loading, saving, and managing AnyDrop configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/anydrop/config.toml` |
//! | macOS | `~/Library/Application Support/com.anydrop.AnyDrop/config.toml` |
//! | Windows | `%APPDATA%\anydrop\AnyDrop\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use anydrop_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::DeviceClass;
use crate::error::{Error, Result};
use crate::transfer::{Dialect, TransportKind};

/// Main configuration struct for AnyDrop.
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
    /// Display name on network
    pub device_name: String,
    /// Stable device id; a random one is used per process when unset
    pub device_id: Option<String>,
    /// Device class advertised by `/api/identify`
    pub device_class: DeviceClass,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "AnyDrop Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            device_id: None,
            device_class: DeviceClass::Laptop,
        }
    }
}

impl GeneralConfig {
    /// The configured device id, or a random one that stays fixed for the
    /// life of the process.
    #[must_use]
    pub fn resolved_device_id(&self) -> String {
        static PROCESS_ID: OnceLock<String> = OnceLock::new();
        self.device_id.clone().unwrap_or_else(|| {
            PROCESS_ID
                .get_or_init(|| uuid::Uuid::new_v4().to_string())
                .clone()
        })
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Acceptor host port; also the port probed on peers
    pub port: u16,
    /// Address the acceptor host binds to
    pub bind_address: IpAddr,
    /// /24 prefix to scan, e.g. "10.0.0" (auto-detected when unset)
    pub subnet: Option<String>,
    /// Bound on a single identification probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Maximum probes in flight during a scan
    pub scan_concurrency: usize,
    /// Bound on opening a signaling socket
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Advertise the host and browse for peers over mDNS
    pub mdns: bool,
    /// How long a scan listens for mDNS answers
    #[serde(with = "humantime_serde")]
    pub mdns_browse: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            subnet: None,
            probe_timeout: Duration::from_secs(1),
            scan_concurrency: 254,
            connect_timeout: Duration::from_secs(5),
            mdns: true,
            mdns_browse: Duration::from_secs(3),
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Data plane used for outbound transfers
    pub transport: TransportKind,
    /// Handshake dialect used for outbound transfers
    pub dialect: Dialect,
    /// Chunk size for chunked transfers
    pub chunk_size: usize,
    /// Pause between chunks
    #[serde(with = "humantime_serde")]
    pub chunk_delay: Duration,
    /// Bound on waiting for READY/REGISTERED after connecting
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Bound on waiting for accept/reject; zero waits forever
    #[serde(with = "humantime_serde")]
    pub accept_timeout: Duration,
    /// Where received files are stored
    pub download_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            dialect: Dialect::Direct,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(5),
            ready_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(120),
            download_dir: None,
        }
    }
}

impl TransferConfig {
    /// The accept timeout, or `None` when disabled.
    #[must_use]
    pub fn accept_deadline(&self) -> Option<Duration> {
        (!self.accept_timeout.is_zero()).then_some(self.accept_timeout)
    }

    /// Resolved download directory.
    ///
    /// Falls back to `<user downloads>/AnyDrop`, then `./received`.
    #[must_use]
    pub fn resolved_download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.join("AnyDrop")))
            .unwrap_or_else(|| PathBuf::from("received"))
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

    /// Load configuration from `path`, defaulting when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Reject values the transfer engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.chunk_size".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.network.scan_concurrency == 0 {
            return Err(Error::InvalidConfig {
                key: "network.scan_concurrency".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(subnet) = &self.network.subnet {
            crate::discovery::Subnet::parse(subnet).ok_or_else(|| Error::InvalidConfig {
                key: "network.subnet".into(),
                reason: format!("'{subnet}' is not a /24 prefix like 192.168.1"),
            })?;
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "anydrop", "AnyDrop")
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

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
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
        let s = s.trim();
        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .parse()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom);
        }
        s.strip_suffix('s')
            .map(|secs| {
                secs.parse()
                    .map(Duration::from_secs)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
