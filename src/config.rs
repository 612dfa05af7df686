//! Configuration is loaded in this priority order:
//! 1. Environment variables (highest priority)
//! 2. Config file (config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! # Environment Variables
//!
//! - `FMS_BRIDGE_DB_PATH` - path to the SQLite database
//! - `FMS_BRIDGE_DEVICE_FILTER` - BLE device name filter used during discovery
//! - `FMS_BRIDGE_SCAN_TIMEOUT` - BLE scan timeout in seconds
//! - `FMS_BRIDGE_HOST` - HTTP server bind address
//! - `FMS_BRIDGE_PORT` - HTTP server port
//! - `FMS_BRIDGE_SIMULATE` - "bike" or "rower" to run against the deterministic
//!   simulator instead of a real BLE adapter; unset or empty means live BLE
//! - `FMS_BRIDGE_WEIGHT_KG` - athlete body weight, required for VO2max estimation
//! - `FMS_BRIDGE_AGE` - athlete age in years, used to derive an estimated max heart rate

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub bluetooth: BluetoothConfig,
    pub server: ServerConfig,
    pub athlete: AthleteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "./fms-bridge.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Substring match against advertised device names; empty matches all.
    #[serde(default = "default_device_name_filter")]
    pub device_name_filter: String,

    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// Reconnect backoff base; the device source doubles this up to a
    /// 30s cap and gives up entirely after 120s of unsuccessful retries.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// "bike" or "rower" selects the deterministic simulator in place of a
    /// real adapter; empty means live BLE.
    #[serde(default)]
    pub simulate: String,
}

fn default_device_name_filter() -> String {
    String::new()
}

fn default_scan_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Inputs to VO2max estimation, not known to any BLE device. `weight_kg`
/// absent disqualifies the estimate outright; `age` absent falls back to an
/// assumed-30-year-old HRmax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthleteConfig {
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub age: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig { path: default_database_path() },
            bluetooth: BluetoothConfig {
                device_name_filter: default_device_name_filter(),
                scan_timeout_secs: default_scan_timeout(),
                reconnect_delay_secs: default_reconnect_delay(),
                simulate: String::new(),
            },
            server: ServerConfig { host: default_host(), port: default_port() },
            athlete: AthleteConfig { weight_kg: None, age: None },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// Load config from file, then apply environment variable overrides.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Self {
        let mut config = Self::from_file_or_default(config_path);
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FMS_BRIDGE_DB_PATH") {
            self.database.path = val;
        }

        if let Ok(val) = std::env::var("FMS_BRIDGE_DEVICE_FILTER") {
            self.bluetooth.device_name_filter = val;
        }
        if let Ok(val) = std::env::var("FMS_BRIDGE_SCAN_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                self.bluetooth.scan_timeout_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("FMS_BRIDGE_SIMULATE") {
            self.bluetooth.simulate = val;
        }

        if let Ok(val) = std::env::var("FMS_BRIDGE_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("FMS_BRIDGE_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = std::env::var("FMS_BRIDGE_WEIGHT_KG") {
            if let Ok(weight) = val.parse() {
                self.athlete.weight_kg = Some(weight);
            }
        }
        if let Ok(val) = std::env::var("FMS_BRIDGE_AGE") {
            if let Ok(age) = val.parse() {
                self.athlete.age = Some(age);
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bluetooth.scan_timeout_secs, 10);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.server.port = 9999;
        config.save(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.server.port, 9999);
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::default().save(&path).unwrap();

        unsafe {
            std::env::set_var("FMS_BRIDGE_PORT", "7000");
        }
        let config = Config::load(&path);
        unsafe {
            std::env::remove_var("FMS_BRIDGE_PORT");
        }

        assert_eq!(config.server.port, 7000);
    }
}
