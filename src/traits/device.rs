//! Primitives the provisioning flow drives: the ESP32 AP-mode HTTP API, the
//! host's WiFi state and a last-resort broadcast discovery.
//!
//! # ESP32 API
//!
//! ```text
//! GET  /ping       - liveness, any 2xx means alive
//! GET  /status     - {connected, ssid?, ip?, signal?, error?}
//! POST /configure  - {ssid, password, security} -> {success, message, data?}
//! POST /restart    - reboot
//! ```

use core::fmt;
use core::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// ============================================================================
// Credentials
// ============================================================================

/// Maximum SSID length per IEEE 802.11.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum WPA2 passphrase length.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Why a credential pair was rejected before leaving the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds 32 bytes.
    SsidTooLong {
        /// Actual length.
        len: usize,
    },
    /// Passphrase longer than 64 bytes.
    PasswordTooLong {
        /// Actual length.
        len: usize,
    },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "network name is empty"),
            Self::SsidTooLong { len } => {
                write!(f, "network name is {} bytes, at most {} allowed", len, MAX_SSID_LEN)
            }
            Self::PasswordTooLong { len } => write!(
                f,
                "password is {} characters, at most {} allowed",
                len, MAX_PASSWORD_LEN
            ),
        }
    }
}

impl std::error::Error for CredentialError {}

/// WiFi credentials pushed to the device.
///
/// The passphrase is wiped from memory when the value is dropped.
#[derive(Clone)]
pub struct WifiCredentials {
    /// Target network.
    pub ssid: String,
    /// Passphrase, empty for open networks.
    pub password: Zeroizing<String>,
    /// Security label sent to the device (`WPA2` or `OPEN`).
    pub security: String,
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("security", &self.security)
            .finish()
    }
}

impl WifiCredentials {
    /// Build and validate a credential pair.
    pub fn new(ssid: impl Into<String>, password: &str) -> Result<Self, CredentialError> {
        let ssid = ssid.into();
        if ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong { len: ssid.len() });
        }
        // Passphrase strength is the device's call; only the hard cap is checked
        if password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: password.len(),
            });
        }
        let security = if password.is_empty() { "OPEN" } else { "WPA2" };
        Ok(Self {
            ssid,
            password: Zeroizing::new(password.to_string()),
            security: security.to_string(),
        })
    }

    /// Whether the network is open.
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

// ============================================================================
// Device API payloads
// ============================================================================

/// Answer to `POST /configure`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// Whether the device accepted the credentials.
    pub success: bool,
    /// Human-readable message from the firmware.
    #[serde(default)]
    pub message: String,
    /// Optional extra payload.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Answer to `GET /status`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the device joined a station network.
    pub connected: bool,
    /// Joined network.
    #[serde(default)]
    pub ssid: Option<String>,
    /// Station address.
    #[serde(default)]
    pub ip: Option<String>,
    /// Signal strength reported by the firmware.
    #[serde(default)]
    pub signal: Option<i32>,
    /// Last firmware-side error.
    #[serde(default)]
    pub error: Option<String>,
}

/// What an identity probe saw at an address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeReply {
    /// Response body.
    pub body: String,
    /// `Server` header, if any.
    pub server: Option<String>,
}

impl ProbeReply {
    /// Whether the body or server header mentions any marker
    /// (case-insensitive).
    pub fn mentions_any(&self, markers: &[String]) -> bool {
        let body = self.body.to_ascii_lowercase();
        let server = self
            .server
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        markers.iter().any(|m| {
            let m = m.to_ascii_lowercase();
            !m.is_empty() && (body.contains(&m) || server.contains(&m))
        })
    }
}

/// Device API failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceHttpError {
    /// Nothing answered at the address.
    Unreachable(String),
    /// Non-success HTTP status.
    Status(u16),
    /// No answer within the deadline.
    Timeout,
    /// The body was not what the firmware normally sends.
    Decode(String),
}

impl fmt::Display for DeviceHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(e) => write!(f, "device unreachable: {}", e),
            Self::Status(code) => write!(f, "device answered HTTP {}", code),
            Self::Timeout => write!(f, "device did not answer in time"),
            Self::Decode(e) => write!(f, "unexpected device response: {}", e),
        }
    }
}

impl std::error::Error for DeviceHttpError {}

/// HTTP client for the ESP32 web API.
pub trait DeviceHttp: Send + Sync + 'static {
    /// `GET /ping` within `timeout`.
    fn ping(&self, ip: &str, timeout: Duration) -> impl Future<Output = bool> + Send;

    /// `GET /` within `timeout`, returning what the identity check needs.
    fn probe(
        &self,
        ip: &str,
        timeout: Duration,
    ) -> impl Future<Output = Option<ProbeReply>> + Send;

    /// `POST /configure` within `timeout`.
    fn configure(
        &self,
        ip: &str,
        credentials: &WifiCredentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<ConfigureResponse, DeviceHttpError>> + Send;

    /// `GET /status`.
    fn status(&self, ip: &str) -> impl Future<Output = Result<DeviceStatus, DeviceHttpError>> + Send;

    /// `POST /restart`.
    fn restart(&self, ip: &str) -> impl Future<Output = Result<(), DeviceHttpError>> + Send;
}

// ============================================================================
// Host WiFi
// ============================================================================

/// One access point from a scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    /// Network name.
    pub ssid: String,
    /// Signal strength, higher is stronger.
    pub signal: i32,
    /// Security description as reported by the host.
    pub security: String,
    /// Channel frequency.
    pub frequency_mhz: Option<u32>,
}

impl WifiNetwork {
    /// Whether the network needs a passphrase.
    pub fn is_secured(&self) -> bool {
        let s = self.security.trim();
        !(s.is_empty() || s == "--" || s.eq_ignore_ascii_case("open"))
    }
}

/// Host WiFi query failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiError(pub String);

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wifi query failed: {}", self.0)
    }
}

impl std::error::Error for WifiError {}

/// The host's own WiFi state.
pub trait WifiInfo: Send + Sync + 'static {
    /// SSID the host is joined to.
    fn current_ssid(&self) -> impl Future<Output = Option<String>> + Send;

    /// Visible access points.
    fn scan(&self) -> impl Future<Output = Result<Vec<WifiNetwork>, WifiError>> + Send;

    /// Host's IPv4 address on the WiFi interface.
    fn current_ipv4(&self) -> impl Future<Output = Option<Ipv4Addr>> + Send;
}

/// Best-effort discovery used after the priority addresses fail.
///
/// No answer is a normal outcome, not an error.
pub trait FallbackDiscovery: Send + Sync + 'static {
    /// Look for the device for at most `timeout`.
    fn discover(&self, timeout: Duration) -> impl Future<Output = Option<String>> + Send;
}

/// Fallback that never finds anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFallback;

impl FallbackDiscovery for NoFallback {
    async fn discover(&self, _timeout: Duration) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_validation() {
        assert!(WifiCredentials::new("MyWiFi", "secret123").is_ok());
        assert_eq!(
            WifiCredentials::new("", "secret123").unwrap_err(),
            CredentialError::SsidEmpty
        );
        assert!(WifiCredentials::new("MyWiFi", "secret").is_ok());
        assert!(matches!(
            WifiCredentials::new("x".repeat(33), "secret123"),
            Err(CredentialError::SsidTooLong { len: 33 })
        ));
        assert!(matches!(
            WifiCredentials::new("MyWiFi", &"p".repeat(65)),
            Err(CredentialError::PasswordTooLong { len: 65 })
        ));
    }

    #[test]
    fn open_network_security_label() {
        let open = WifiCredentials::new("Cafe", "").unwrap();
        assert!(open.is_open());
        assert_eq!(open.security, "OPEN");
        assert_eq!(WifiCredentials::new("Home", "secret123").unwrap().security, "WPA2");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = WifiCredentials::new("Home", "hunter2hunter2").unwrap();
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn probe_identity_markers() {
        let markers = vec!["esp32".to_string(), "softstarter".to_string()];
        let by_body = ProbeReply {
            body: "<h1>ESP32 Motor</h1>".into(),
            server: None,
        };
        let by_header = ProbeReply {
            body: String::new(),
            server: Some("SoftStarter/1.0".into()),
        };
        let router = ProbeReply {
            body: "<title>Router login</title>".into(),
            server: Some("lighttpd".into()),
        };
        assert!(by_body.mentions_any(&markers));
        assert!(by_header.mentions_any(&markers));
        assert!(!router.mentions_any(&markers));
    }

    #[test]
    fn status_payload_tolerates_missing_fields() {
        let status: DeviceStatus = serde_json::from_str(r#"{"connected":false}"#).unwrap();
        assert!(!status.connected);
        assert_eq!(status.ip, None);
    }

    #[test]
    fn network_security() {
        let net = |sec: &str| WifiNetwork {
            ssid: "n".into(),
            signal: 50,
            security: sec.into(),
            frequency_mhz: None,
        };
        assert!(net("WPA2").is_secured());
        assert!(!net("--").is_secured());
        assert!(!net("").is_secured());
    }
}
