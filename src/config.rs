//! Application configuration.
//!
//! Every section has sensible defaults and `with_*` builders, and the whole
//! tree round-trips through TOML. Durations are stored as milliseconds so
//! the file stays hand-editable.
//!
//! # Example
//!
//! ```rust
//! use rs_softstart::config::{Config, MqttConfig, ProvisioningConfig};
//!
//! let config = Config::default()
//!     .with_mqtt(MqttConfig::default().with_broker("tcp://192.168.1.100:1883"))
//!     .with_provisioning(ProvisioningConfig::default().with_poll_interval_ms(5000));
//!
//! assert_eq!(config.mqtt.topic_prefix, "motor");
//! ```

use core::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::{BrokerEndpoint, MqttCredentials, TransportError};

/// Directory name under the platform config/data dirs.
pub const APP_DIR: &str = "rs-softstart";

// ============================================================================
// Errors
// ============================================================================

/// Loading or saving the configuration failed.
#[derive(Debug)]
pub enum ConfigError {
    /// File system error.
    Io(std::io::Error),
    /// TOML could not be parsed.
    Parse(String),
    /// Configuration could not be serialized.
    Serialize(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {}", e),
            Self::Parse(e) => write!(f, "invalid config file: {}", e),
            Self::Serialize(e) => write!(f, "could not write config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MQTT transport.
    pub mqtt: MqttConfig,
    /// Bluetooth transport.
    pub bluetooth: BluetoothConfig,
    /// ESP32 discovery and provisioning.
    pub provisioning: ProvisioningConfig,
    /// Endpoint resolution.
    pub endpoints: EndpointConfig,
    /// Backend audit API.
    pub backend: BackendConfig,
}

impl Config {
    /// Set MQTT configuration
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }

    /// Set Bluetooth configuration
    pub fn with_bluetooth(mut self, bluetooth: BluetoothConfig) -> Self {
        self.bluetooth = bluetooth;
        self
    }

    /// Set provisioning configuration
    pub fn with_provisioning(mut self, provisioning: ProvisioningConfig) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Set endpoint configuration
    pub fn with_endpoints(mut self, endpoints: EndpointConfig) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Set backend configuration
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// `<config dir>/rs-softstart/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// `<data dir>/rs-softstart`, where the network configuration lives.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Parse TOML. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        log::info!("wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Save to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

// ============================================================================
// MQTT Config
// ============================================================================

/// MQTT transport configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker descriptor, `scheme://host:port`.
    pub broker: String,
    /// First topic segment (`motor` -> `motor/<device>/speed`).
    pub topic_prefix: String,
    /// Device id segment.
    pub device_id: String,
    /// Username (empty = no auth).
    pub username: String,
    /// Password.
    pub password: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// How long to wait for the broker's acknowledgement.
    pub connect_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://192.168.1.100:1883".to_string(),
            topic_prefix: "motor".to_string(),
            device_id: "esp32_001".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
        }
    }
}

impl MqttConfig {
    /// Set the broker descriptor
    pub fn with_broker(mut self, broker: &str) -> Self {
        self.broker = broker.to_string();
        self
    }

    /// Set the topic prefix
    pub fn with_topic_prefix(mut self, prefix: &str) -> Self {
        self.topic_prefix = prefix.to_string();
        self
    }

    /// Set the device id
    pub fn with_device_id(mut self, id: &str) -> Self {
        self.device_id = id.to_string();
        self
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Set the keep-alive interval
    pub fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Parsed broker endpoint.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, TransportError> {
        BrokerEndpoint::parse(&self.broker)
    }

    /// Credentials, when a username is set.
    pub fn credentials(&self) -> Option<MqttCredentials> {
        (!self.username.is_empty()).then(|| MqttCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    /// Keep-alive as a duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ============================================================================
// Bluetooth Config
// ============================================================================

/// Bluetooth transport configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Connect attempts before giving up.
    pub connect_attempts: u32,
    /// Delay between connect attempts.
    pub retry_delay_ms: u64,
    /// Delay between streamed soft-start steps.
    pub step_delay_ms: u64,
    /// Read buffer size for the telemetry loop.
    pub read_buffer_size: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_delay_ms: 1000,
            step_delay_ms: 100,
            read_buffer_size: 1024,
        }
    }
}

impl BluetoothConfig {
    /// Set the number of connect attempts (at least one)
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the retry delay
    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    /// Set the inter-step delay
    pub fn with_step_delay_ms(mut self, ms: u64) -> Self {
        self.step_delay_ms = ms;
        self
    }

    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Step delay as a duration.
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

// ============================================================================
// Provisioning Config
// ============================================================================

/// ESP32 discovery and provisioning configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Device address while in AP mode.
    pub ap_ip: String,
    /// HTTP port of the device web server.
    pub device_port: u16,
    /// AP-mode liveness probe timeout.
    pub ap_probe_timeout_ms: u64,
    /// Liveness probe timeout for stored or manual addresses.
    pub ping_timeout_ms: u64,
    /// Per-address identity probe timeout during rediscovery.
    pub probe_timeout_ms: u64,
    /// Credential push timeout.
    pub configure_timeout_ms: u64,
    /// Unconditional wait for the device to reboot and join the network.
    pub restart_grace_ms: u64,
    /// Post-reboot rediscovery timeout.
    pub rediscovery_timeout_ms: u64,
    /// Liveness polling interval once connected.
    pub poll_interval_ms: u64,
    /// Addresses tried first during rediscovery, in order.
    pub priority_ips: Vec<String>,
    /// Case-insensitive markers that identify the device in a probe reply.
    pub identity_markers: Vec<String>,
    /// SSID prefix of the device's own access point.
    pub device_ap_prefix: String,
    /// Concurrent probes during a subnet sweep.
    pub sweep_concurrency: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let priority_ips = ["192.168.1", "192.168.0"]
            .iter()
            .flat_map(|net| (100..=105).map(move |host| format!("{}.{}", net, host)))
            .collect();
        Self {
            ap_ip: "192.168.4.1".to_string(),
            device_port: 80,
            ap_probe_timeout_ms: 5_000,
            ping_timeout_ms: 3_000,
            probe_timeout_ms: 2_000,
            configure_timeout_ms: 15_000,
            restart_grace_ms: 8_000,
            rediscovery_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
            priority_ips,
            identity_markers: vec![
                "esp32".to_string(),
                "softstarter".to_string(),
                "motor".to_string(),
            ],
            device_ap_prefix: "ESP32".to_string(),
            sweep_concurrency: 32,
        }
    }
}

impl ProvisioningConfig {
    /// Set the AP-mode address
    pub fn with_ap_ip(mut self, ip: &str) -> Self {
        self.ap_ip = ip.to_string();
        self
    }

    /// Set the device web server port
    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    /// Set the rediscovery priority list
    pub fn with_priority_ips(mut self, ips: Vec<String>) -> Self {
        self.priority_ips = ips;
        self
    }

    /// Set the liveness polling interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the post-reboot rediscovery timeout
    pub fn with_rediscovery_timeout_ms(mut self, ms: u64) -> Self {
        self.rediscovery_timeout_ms = ms;
        self
    }

    /// AP-mode probe timeout.
    pub fn ap_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.ap_probe_timeout_ms)
    }

    /// Liveness probe timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Identity probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Credential push timeout.
    pub fn configure_timeout(&self) -> Duration {
        Duration::from_millis(self.configure_timeout_ms)
    }

    /// Reboot grace period.
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    /// Rediscovery timeout.
    pub fn rediscovery_timeout(&self) -> Duration {
        Duration::from_millis(self.rediscovery_timeout_ms)
    }

    /// Polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Endpoint Config
// ============================================================================

/// Where the motor endpoints live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// The provisioned ESP32 on the local network.
    #[default]
    Local,
    /// A fixed remote host.
    Remote,
    /// A fixed test host.
    Test,
}

/// Endpoint resolution settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Which endpoints to use.
    pub mode: NetworkMode,
    /// Host used in remote mode.
    pub remote_host: String,
    /// Host used in test mode.
    pub test_host: String,
    /// Broker port.
    pub mqtt_port: u16,
    /// Device API port.
    pub api_port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Local,
            remote_host: "broker.hivemq.com".to_string(),
            test_host: "test.mosquitto.org".to_string(),
            mqtt_port: 1883,
            api_port: 80,
        }
    }
}

impl EndpointConfig {
    /// Set the mode
    pub fn with_mode(mut self, mode: NetworkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the remote host
    pub fn with_remote_host(mut self, host: &str) -> Self {
        self.remote_host = host.to_string();
        self
    }
}

// ============================================================================
// Backend Config
// ============================================================================

/// Backend audit API settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL; audit is disabled when empty.
    pub base_url: String,
    /// Path of the motor command endpoint.
    pub command_path: String,
    /// Bearer token (empty = none).
    pub token: String,
    /// Request timeout.
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            command_path: "/api/motor/command".to_string(),
            token: String::new(),
            timeout_ms: 5_000,
        }
    }
}

impl BackendConfig {
    /// Set the base URL
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    /// Whether audit calls should be made.
    pub fn is_enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Full command URL.
    pub fn command_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.command_path)
    }

    /// Request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_firmware() {
        let config = Config::default();
        assert_eq!(config.provisioning.ap_ip, "192.168.4.1");
        assert_eq!(config.provisioning.configure_timeout(), Duration::from_secs(15));
        assert_eq!(config.provisioning.restart_grace(), Duration::from_secs(8));
        assert_eq!(config.provisioning.rediscovery_timeout(), Duration::from_secs(10));
        assert_eq!(config.provisioning.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.bluetooth.connect_attempts, 3);
        assert_eq!(config.bluetooth.step_delay(), Duration::from_millis(100));
    }

    #[test]
    fn priority_list_covers_two_subnets() {
        let ips = ProvisioningConfig::default().priority_ips;
        assert_eq!(ips.len(), 12);
        assert_eq!(ips[0], "192.168.1.100");
        assert_eq!(ips[5], "192.168.1.105");
        assert_eq!(ips[6], "192.168.0.100");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [mqtt]
            device_id = "esp32_042"

            [endpoints]
            mode = "remote"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.device_id, "esp32_042");
        assert_eq!(config.mqtt.topic_prefix, "motor");
        assert_eq!(config.endpoints.mode, NetworkMode::Remote);
        assert_eq!(config.bluetooth, BluetoothConfig::default());
    }

    #[test]
    fn toml_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::default()
            .with_mqtt(MqttConfig::default().with_auth("user", "pw"))
            .with_backend(BackendConfig::default().with_base_url("https://api.example.com/"));
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml("[mqtt\nbroker ="),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn mqtt_helpers() {
        let mqtt = MqttConfig::default();
        assert!(mqtt.credentials().is_none());
        assert_eq!(mqtt.endpoint().unwrap().port, 1883);
        let mqtt = mqtt.with_auth("u", "p");
        assert_eq!(mqtt.credentials().unwrap().username, "u");
    }

    #[test]
    fn backend_url() {
        let backend = BackendConfig::default().with_base_url("https://api.example.com/");
        assert!(backend.is_enabled());
        assert_eq!(backend.command_url(), "https://api.example.com/api/motor/command");
        assert!(!BackendConfig::default().is_enabled());
    }
}
