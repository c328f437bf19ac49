//! Engine configuration
//!
//! Plain serde structs with defaults; consumers construct one [`Config`] and
//! inject it into the engine at startup. There is no global state.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local device identity settings
    pub device: DeviceConfig,

    /// Network ports and timing
    #[serde(default)]
    pub network: NetworkConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Local device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    pub device_type: String,

    /// Device id; generated on first start if not set
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP port for accepting links (0 picks an ephemeral port)
    #[serde(default = "default_discovery_port")]
    pub tcp_port: u16,

    /// Fallback port range start
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Fallback port range end
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Discovery re-broadcast interval in seconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// Identity read / TLS handshake bound in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// In-flight send drain bound during shutdown, in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum reconnect attempts per disconnect
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,

    /// Initial reconnect delay in milliseconds (doubles per attempt)
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    /// Per-plugin dispatch queue depth
    #[serde(default = "default_dispatch_queue_depth")]
    pub dispatch_queue_depth: usize,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Trust store file (persisted pairing records)
    pub trust_store: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            tcp_port: default_discovery_port(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            broadcast_interval_secs: default_broadcast_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            reconnect_max_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            dispatch_queue_depth: default_dispatch_queue_depth(),
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }
}

fn default_discovery_port() -> u16 {
    1716
}

fn default_port_range_start() -> u16 {
    1714
}

fn default_port_range_end() -> u16 {
    1764
}

fn default_broadcast_interval() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    3
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay() -> u64 {
    500
}

fn default_reconnect_max_delay() -> u64 {
    15_000
}

fn default_dispatch_queue_depth() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> Config {
        Config {
            device: DeviceConfig {
                name: "Test Desktop".to_string(),
                device_type: "desktop".to_string(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            paths: PathConfig {
                trust_store: PathBuf::from("trust.json"),
            },
        }
    }

    #[test]
    fn test_network_defaults() {
        let network = NetworkConfig::default();
        assert_eq!(network.discovery_port, 1716);
        assert_eq!(network.port_range_start, 1714);
        assert_eq!(network.port_range_end, 1764);
        assert_eq!(network.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = test_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.device.name, "Test Desktop");
        assert_eq!(loaded.network.discovery_port, 1716);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{
            "device": { "name": "Laptop", "device_type": "laptop" },
            "paths": { "trust_store": "/tmp/trust.json" }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.network.reconnect_max_attempts, 5);
        assert_eq!(config.network.dispatch_queue_depth, 32);
        assert!(config.device.device_id.is_none());
    }
}
