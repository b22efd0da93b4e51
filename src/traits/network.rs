//! Network primitives: MQTT client, broker connector and the backend audit API.
//!
//! # Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`MqttClient`] | Publish/subscribe on an open broker session |
//! | [`MqttConnector`] | Opens a session and hands back client + inbound queue |
//! | [`CommandAudit`] | Secondary HTTP channel recording every motor command |
//!
//! # Topic layout
//!
//! ```text
//! motor/<device_id>/command  - ASCII motor command (publish)
//! motor/<device_id>/type     - command label: arranque6p | continuo | paro
//! motor/<device_id>/speed    - decimal integer speed
//! motor/<device_id>/state    - free-form state string
//! motor/<device_id>/current  - decimal float, amperes
//! motor/<device_id>/voltage  - decimal float, volts
//! motor/<device_id>/raw      - diagnostics only
//! ```

use core::fmt;
use core::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use super::controller::TransportError;
use crate::protocol::MotorCommand;

// ============================================================================
// Broker session
// ============================================================================

/// MQTT client handle for an open session.
///
/// Calls are synchronous: they enqueue into the client's outbound queue and
/// return without waiting for broker acknowledgement. Two publishes issued
/// back to back leave in that order.
pub trait MqttClient: Send + Sync + 'static {
    /// Broker-side or queue failure; only ever logged or wrapped.
    type Error: fmt::Display;

    /// Publish at-least-once.
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Self::Error>;

    /// Subscribe at-least-once.
    fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Drop a subscription.
    fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Close the session.
    fn disconnect(&self) -> Result<(), Self::Error>;

    /// Whether the session is still up.
    fn is_connected(&self) -> bool;
}

/// Inbound telemetry publish, as handed to the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    /// Full topic, `<prefix>/<device>/<leaf>`.
    pub topic: String,
    /// Payload bytes; telemetry is ASCII text.
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Build a message from a topic and payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload text, or `None` for non-UTF-8 payloads.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }

    /// Last `/`-separated topic segment.
    pub fn leaf(&self) -> &str {
        self.topic.rsplit('/').next().unwrap_or(&self.topic)
    }
}

/// An acknowledged broker session.
#[derive(Debug)]
pub struct MqttSession<C> {
    /// Client handle.
    pub client: C,
    /// Inbound publishes. Closes when the session is lost.
    pub incoming: mpsc::UnboundedReceiver<MqttMessage>,
}

/// Broker credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttCredentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Everything needed to open a session.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Broker to connect to.
    pub endpoint: BrokerEndpoint,
    /// Unique client id.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Optional credentials.
    pub credentials: Option<MqttCredentials>,
    /// How long to wait for the connection acknowledgement.
    pub connect_timeout: Duration,
}

/// Opens broker sessions.
///
/// `connect` resolves exactly once: with a session after the broker
/// acknowledged the connection, or with an error.
pub trait MqttConnector: Send + Sync + 'static {
    /// Client handle type produced on success.
    type Client: MqttClient;

    /// Open a session.
    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<MqttSession<Self::Client>, TransportError>> + Send;
}

/// Shared connectors, so a test can keep a handle to the one it injected.
impl<T: MqttConnector> MqttConnector for std::sync::Arc<T> {
    type Client = T::Client;

    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<MqttSession<Self::Client>, TransportError>> + Send {
        (**self).connect(options)
    }
}

// ============================================================================
// Broker endpoint
// ============================================================================

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Parsed `scheme://host:port` broker descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// `tcp`, `mqtt`, `ssl` or `mqtts`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl BrokerEndpoint {
    /// Plain TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: host.into(),
            port,
        }
    }

    /// Parse a descriptor such as `tcp://192.168.1.100:1883`.
    ///
    /// The port defaults to 1883 when omitted.
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(uri.to_string());
        let (scheme, rest) = uri.trim().split_once("://").ok_or_else(invalid)?;
        let scheme = scheme.to_ascii_lowercase();
        if !matches!(scheme.as_str(), "tcp" | "mqtt" | "ssl" | "mqtts") {
            return Err(invalid());
        }
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_MQTT_PORT),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// Whether the scheme asks for TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.scheme.as_str(), "ssl" | "mqtts")
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// ============================================================================
// Backend audit channel
// ============================================================================

/// Backend API failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiError {
    /// Request could not be sent.
    Request(String),
    /// Server answered with a non-success status.
    Status(u16),
    /// Missing or rejected token.
    Unauthorized,
    /// No answer in time.
    Timeout,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "request failed: {}", e),
            Self::Status(code) => write!(f, "server returned HTTP {}", code),
            Self::Unauthorized => write!(f, "not authorized"),
            Self::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Secondary channel that records each motor command with the backend.
///
/// Callers treat this as best effort: a failure here never fails the send.
pub trait CommandAudit: Send + Sync + 'static {
    /// Record one command.
    fn record(
        &self,
        command: &MotorCommand,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Audit sink that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAudit;

impl CommandAudit for NoAudit {
    async fn record(&self, _command: &MotorCommand) -> Result<(), ApiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_descriptor() {
        let ep = BrokerEndpoint::parse("tcp://192.168.1.100:1883").unwrap();
        assert_eq!(ep, BrokerEndpoint::tcp("192.168.1.100", 1883));
        assert_eq!(ep.to_string(), "tcp://192.168.1.100:1883");
        assert!(!ep.is_tls());
    }

    #[test]
    fn port_defaults_and_tls_schemes() {
        let ep = BrokerEndpoint::parse("ssl://broker.example.com").unwrap();
        assert_eq!(ep.port, DEFAULT_MQTT_PORT);
        assert!(ep.is_tls());
    }

    #[test]
    fn rejects_bad_descriptors() {
        for bad in ["192.168.1.1:1883", "http://host:80", "tcp://:1883", "tcp://host:notaport"] {
            assert!(
                matches!(BrokerEndpoint::parse(bad), Err(TransportError::InvalidEndpoint(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn message_leaf_is_last_segment() {
        let msg = MqttMessage::new("motor/esp32_001/speed", b"120".to_vec());
        assert_eq!(msg.leaf(), "speed");
        assert_eq!(msg.payload_str(), Some("120"));
        assert_eq!(MqttMessage::new("speed", Vec::new()).leaf(), "speed");
    }
}
