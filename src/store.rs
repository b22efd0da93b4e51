//! Network Configuration Store.
//!
//! Remembers where the provisioned ESP32 lives and which WiFi network it was
//! provisioned on. Only successful provisioning or a manual IP entry writes
//! it; anything may read it. Writes replace the JSON file atomically (temp
//! file + rename) under a mutex, so a reader never sees a half-written file.
//!
//! A stored configuration goes stale the moment the host roams to another
//! SSID. The fields stay untouched; [`NetworkConfigStore::is_configuration_valid`]
//! just starts returning `false`.

use core::fmt;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{EndpointConfig, NetworkMode};

/// File name used under the data directory.
pub const STORE_FILE: &str = "network.json";

// ============================================================================
// Errors
// ============================================================================

/// Reading or writing the store failed.
#[derive(Debug)]
pub enum StoreError {
    /// File system error.
    Io(std::io::Error),
    /// The stored file is not valid JSON for [`NetworkConfig`].
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "network store I/O error: {}", e),
            Self::Corrupt(e) => write!(f, "network store is corrupt: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================================
// NetworkConfig
// ============================================================================

/// Last-known-good device location.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the ESP32 on the operational network.
    pub esp32_ip: String,
    /// Broker address. Defaults to the ESP32 address.
    pub mqtt_broker_ip: String,
    /// Set by a successful provisioning or manual IP entry.
    pub is_configured: bool,
    /// When the configuration was written.
    pub last_config_time: Option<DateTime<Utc>>,
    /// Host SSID at configuration time.
    pub network_ssid: String,
}

impl NetworkConfig {
    /// Whether this configuration can be trusted on `current_ssid`.
    pub fn is_valid_on(&self, current_ssid: Option<&str>) -> bool {
        self.is_configured
            && !self.esp32_ip.trim().is_empty()
            && current_ssid == Some(self.network_ssid.as_str())
    }
}

// ============================================================================
// Store
// ============================================================================

/// Persisted [`NetworkConfig`] with single-writer semantics.
#[derive(Debug)]
pub struct NetworkConfigStore {
    path: Option<PathBuf>,
    current: RwLock<NetworkConfig>,
    write_lock: Mutex<()>,
}

impl NetworkConfigStore {
    /// A store that never touches the file system.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(NetworkConfig::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let current = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| StoreError::Corrupt(e.to_string()))?
        } else {
            NetworkConfig::default()
        };
        debug!("network store opened at {}", path.display());
        Ok(Self {
            path: Some(path),
            current: RwLock::new(current),
            write_lock: Mutex::new(()),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> NetworkConfig {
        self.current.read().clone()
    }

    /// Record a working device address.
    ///
    /// `broker_ip` defaults to `esp32_ip`.
    pub fn save_device(
        &self,
        esp32_ip: &str,
        broker_ip: Option<&str>,
        ssid: Option<&str>,
    ) -> Result<NetworkConfig, StoreError> {
        let config = NetworkConfig {
            esp32_ip: esp32_ip.to_string(),
            mqtt_broker_ip: broker_ip
                .filter(|b| !b.trim().is_empty())
                .unwrap_or(esp32_ip)
                .to_string(),
            is_configured: true,
            last_config_time: Some(Utc::now()),
            network_ssid: ssid.unwrap_or_default().to_string(),
        };
        self.replace(config.clone())?;
        info!("saved device {} on network {:?}", esp32_ip, config.network_ssid);
        Ok(config)
    }

    /// Forget the stored device.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.replace(NetworkConfig::default())
    }

    fn replace(&self, config: NetworkConfig) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if let Some(path) = &self.path {
            write_atomic(path, &config)?;
        }
        *self.current.write() = config;
        Ok(())
    }

    /// Whether the stored device can be trusted on `current_ssid`.
    pub fn is_configuration_valid(&self, current_ssid: Option<&str>) -> bool {
        self.current.read().is_valid_on(current_ssid)
    }

    fn host_for(&self, endpoints: &EndpointConfig, pick: fn(&NetworkConfig) -> &str) -> Option<String> {
        match endpoints.mode {
            NetworkMode::Local => {
                let config = self.current.read();
                let host = pick(&config).trim();
                (config.is_configured && !host.is_empty()).then(|| host.to_string())
            }
            NetworkMode::Remote => Some(endpoints.remote_host.clone()),
            NetworkMode::Test => Some(endpoints.test_host.clone()),
        }
    }

    /// Broker URL, `tcp://host:port`.
    pub fn mqtt_url(&self, endpoints: &EndpointConfig) -> Option<String> {
        self.host_for(endpoints, |c| &c.mqtt_broker_ip)
            .map(|host| format!("tcp://{}:{}", host, endpoints.mqtt_port))
    }

    /// Device API base URL, `http://host:port/`.
    pub fn api_url(&self, endpoints: &EndpointConfig) -> Option<String> {
        self.host_for(endpoints, |c| &c.esp32_ip)
            .map(|host| format!("http://{}:{}/", host, endpoints.api_port))
    }

    /// Flattened view for display and debugging.
    pub fn diagnostics(
        &self,
        endpoints: &EndpointConfig,
        current_ssid: Option<&str>,
    ) -> BTreeMap<String, String> {
        let config = self.snapshot();
        let mode = match endpoints.mode {
            NetworkMode::Local => "local",
            NetworkMode::Remote => "remote",
            NetworkMode::Test => "test",
        };
        let mut map = BTreeMap::new();
        map.insert("mode".to_string(), mode.to_string());
        map.insert("esp32_ip".to_string(), config.esp32_ip.clone());
        map.insert("mqtt_broker_ip".to_string(), config.mqtt_broker_ip.clone());
        map.insert("is_configured".to_string(), config.is_configured.to_string());
        map.insert(
            "last_config_time".to_string(),
            config
                .last_config_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        );
        map.insert("network_ssid".to_string(), config.network_ssid.clone());
        map.insert(
            "current_ssid".to_string(),
            current_ssid.unwrap_or_default().to_string(),
        );
        map.insert(
            "is_valid".to_string(),
            config.is_valid_on(current_ssid).to_string(),
        );
        map.insert(
            "mqtt_url".to_string(),
            self.mqtt_url(endpoints).unwrap_or_default(),
        );
        map.insert(
            "api_url".to_string(),
            self.api_url(endpoints).unwrap_or_default(),
        );
        map
    }
}

fn write_atomic(path: &Path, config: &NetworkConfig) -> Result<(), StoreError> {
    let json =
        serde_json::to_string_pretty(config).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
