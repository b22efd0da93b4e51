//! The transport contract every motor link implements.
//!
//! The UI layer drives Bluetooth and MQTT through [`MotorController`]
//! without branching on the transport type. All three motor commands carry
//! identical success/failure semantics on every transport.
//!
//! # Optional telemetry
//!
//! Speed and status are mandatory. Current, voltage and mode are optional
//! capabilities: the default `on_current`/`on_voltage`/`on_mode` methods
//! accept a callback and never call it, and [`TelemetrySupport`] tells the
//! caller which metrics will actually arrive.
//!
//! # Example
//!
//! ```rust,ignore
//! use rs_softstart::traits::MotorController;
//!
//! async fn ramp<T: MotorController>(link: &T) -> Result<(), rs_softstart::TransportError> {
//!     link.on_speed(|speed| println!("speed {speed}"));
//!     link.connect().await?;
//!     link.send_soft_start([40, 80, 120, 160, 200, 254]).await
//! }
//! ```

use core::fmt;
use core::future::Future;

use crate::protocol::{MotorCommand, STEP_COUNT};

// ============================================================================
// Connection state
// ============================================================================

/// State of one transport session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session open.
    #[default]
    Disconnected,
    /// Session is being opened.
    Connecting,
    /// Session is open and usable.
    Connected,
    /// The last attempt failed.
    Error(String),
}

impl ConnectionState {
    /// Short lowercase label for display.
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error(_) => "error",
        }
    }
}

/// Which transport a session runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Classic Bluetooth serial port profile.
    Bluetooth,
    /// MQTT broker session.
    Mqtt,
}

impl TransportKind {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Mqtt => "mqtt",
        }
    }
}

/// Telemetry metrics a transport can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelemetrySupport {
    /// Speed readings.
    pub speed: bool,
    /// State strings.
    pub status: bool,
    /// Current readings.
    pub current: bool,
    /// Voltage readings.
    pub voltage: bool,
    /// Mode strings.
    pub mode: bool,
}

impl TelemetrySupport {
    /// Speed and status only.
    pub const SPEED_AND_STATUS: Self = Self {
        speed: true,
        status: true,
        current: false,
        voltage: false,
        mode: false,
    };

    /// Speed, status, current and voltage.
    pub const ELECTRICAL: Self = Self {
        speed: true,
        status: true,
        current: true,
        voltage: true,
        mode: false,
    };
}

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failure, reported to the caller as a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// An operation needed an open session.
    NotConnected,
    /// A connect attempt is already in flight.
    AlreadyConnecting,
    /// Opening the session failed.
    Connect(String),
    /// A socket read or write failed.
    Io(String),
    /// Publishing to the broker failed.
    Publish(String),
    /// Subscribing or unsubscribing failed.
    Subscribe(String),
    /// The endpoint descriptor could not be parsed.
    InvalidEndpoint(String),
    /// No device was selected for the session.
    NoDevice,
    /// Device discovery could not be started.
    Discovery(String),
    /// The operation did not complete in time.
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to the motor controller"),
            Self::AlreadyConnecting => write!(f, "already connecting"),
            Self::Connect(e) => write!(f, "connection failed: {}", e),
            Self::Io(e) => write!(f, "link error: {}", e),
            Self::Publish(e) => write!(f, "publish failed: {}", e),
            Self::Subscribe(e) => write!(f, "subscription failed: {}", e),
            Self::InvalidEndpoint(e) => write!(f, "invalid endpoint: {}", e),
            Self::NoDevice => write!(f, "no device selected"),
            Self::Discovery(e) => write!(f, "device discovery failed: {}", e),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Motor controller contract
// ============================================================================

/// Capability contract shared by every motor transport.
///
/// All methods take `&self`; implementations use interior mutability so one
/// transport can be shared between the UI task and background workers.
///
/// # Callbacks
///
/// Every `on_*` registration replaces the previous callback for that metric.
/// There is exactly one subscriber per metric.
pub trait MotorController: Send + Sync {
    /// Open the session.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the session. Best effort: failures are logged, not returned.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Send a 6-step soft start. Values are clamped to `[0, 254]`.
    fn send_soft_start(
        &self,
        values: [i32; STEP_COUNT],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send a continuous start.
    fn send_continuous(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send an emergency stop.
    fn send_stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send any [`MotorCommand`].
    fn send_command(
        &self,
        command: MotorCommand,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            match command {
                MotorCommand::SoftStart6Step { values } => {
                    self.send_soft_start(values.map(i32::from)).await
                }
                MotorCommand::ContinuousStart => self.send_continuous().await,
                MotorCommand::EmergencyStop => self.send_stop().await,
            }
        }
    }

    /// Register the speed callback.
    fn on_speed(&self, callback: impl Fn(i32) + Send + Sync + 'static);

    /// Register the status callback.
    fn on_status(&self, callback: impl Fn(&str) + Send + Sync + 'static);

    /// Register the current callback. No-op unless supported.
    fn on_current(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        let _ = callback;
    }

    /// Register the voltage callback. No-op unless supported.
    fn on_voltage(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        let _ = callback;
    }

    /// Register the mode callback. No-op unless supported.
    fn on_mode(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let _ = callback;
    }

    /// Which metrics this transport delivers.
    fn telemetry_support(&self) -> TelemetrySupport {
        TelemetrySupport::SPEED_AND_STATUS
    }

    /// Whether the session is open.
    fn is_connected(&self) -> bool;

    /// Current session state.
    fn connection_state(&self) -> ConnectionState;

    /// Human-readable descriptor of the link.
    fn connection_info(&self) -> String;

    /// Which transport this is.
    fn kind(&self) -> TransportKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_labels() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Error("x".into()).as_str(), "error");
    }

    #[test]
    fn transport_errors_are_distinct() {
        let messages: Vec<String> = [
            TransportError::NotConnected,
            TransportError::AlreadyConnecting,
            TransportError::Timeout,
            TransportError::NoDevice,
        ]
        .iter()
        .map(|e| e.to_string())
        .collect();
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(TransportError::AlreadyConnecting.to_string(), "already connecting");
    }

    #[test]
    fn telemetry_support_presets() {
        assert!(!TelemetrySupport::SPEED_AND_STATUS.current);
        assert!(TelemetrySupport::ELECTRICAL.voltage);
        assert!(!TelemetrySupport::ELECTRICAL.mode);
    }
}
