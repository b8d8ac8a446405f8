//! Bridge configuration
//!
//! Loaded once at startup from a TOML file. Every section has defaults, so a
//! missing file yields a working configuration pointed at the public test
//! broker. A file that exists but cannot be read or parsed is a fatal error.

use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable that overrides the configuration file location
pub const CONFIG_ENV_VAR: &str = "CLIMADUINO_BRIDGE_CONFIG";

const CONFIG_DIR: &str = ".config/climaduino-bridge";
const CONFIG_FILE: &str = "config.toml";
const FALLBACK_HOSTNAME: &str = "climaduino";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub receiver: ReceiverConfig,
    pub bridge: BridgeLinkConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Overrides the hostname used in the device topic prefix
    pub name: Option<String>,
}

/// Local readings socket settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
    pub socket_path: PathBuf,
    /// Retries after the first failed bind
    pub bind_retries: u32,
    pub bind_retry_delay_secs: u64,
    /// Upper bound on one snapshot message
    pub max_snapshot_bytes: usize,
    /// Time a producer gets to send one complete snapshot
    pub read_timeout_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/climaduino_mqtt_bridge"),
            bind_retries: 20,
            bind_retry_delay_secs: 5,
            max_snapshot_bytes: 64 * 1024,
            read_timeout_secs: 10,
        }
    }
}

impl ReceiverConfig {
    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_secs(self.bind_retry_delay_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Loopback TCP-JSON link to the microcontroller-facing bridge process
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeLinkConfig {
    pub address: String,
    pub response_timeout_secs: u64,
    pub response_poll_ms: u64,
}

impl Default for BridgeLinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5700".into(),
            response_timeout_secs: 10,
            response_poll_ms: 100,
        }
    }
}

impl BridgeLinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn response_poll(&self) -> Duration {
        Duration::from_millis(self.response_poll_ms)
    }
}

impl BridgeConfig {
    /// Loads the configuration from `$CLIMADUINO_BRIDGE_CONFIG` or the default
    /// location under the home directory.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => PathBuf::from(path),
            None => default_config_path(),
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(
                "No config file at {}, using defaults",
                path.to_string_lossy()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded config from {}: {:?}", path.to_string_lossy(), config);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Hostname used for the device topic prefix
    pub fn device_name(&self) -> String {
        match &self.device.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => local_hostname(),
        }
    }

    pub fn client_id(&self, device_name: &str) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("climaduino-{}", device_name))
    }
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Unable to determine home directory, looking for config in working directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }

    for source in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = std::fs::read_to_string(source) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    warn!(
        "Unable to determine hostname, falling back to '{}'",
        FALLBACK_HOSTNAME
    );
    FALLBACK_HOSTNAME.to_string()
}
