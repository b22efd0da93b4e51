//! Tagged-variant transport.
//!
//! [`MotorController`] returns `impl Future`, so it cannot be a trait
//! object. [`AnyTransport`] closes over the two transports instead, letting
//! the orchestration layer hold "whichever link is active" as one type and
//! call it without branching on the kind.
//!
//! ```rust
//! use rs_softstart::config::MqttConfig;
//! use rs_softstart::hal::{MockMqttConnector, MockSppAdapter};
//! use rs_softstart::traits::{MotorController, TransportKind};
//! use rs_softstart::transport::{AnyTransport, MqttTransport};
//!
//! let link: AnyTransport<MockSppAdapter, MockMqttConnector> =
//!     AnyTransport::Mqtt(MqttTransport::new(MockMqttConnector::new(), MqttConfig::default()));
//! assert_eq!(link.kind(), TransportKind::Mqtt);
//! assert!(!link.is_connected());
//! ```

use tokio::sync::watch;

use crate::protocol::{MotorCommand, STEP_COUNT};
use crate::traits::{
    ConnectionState, MotorController, MqttConnector, SppAdapter, TelemetrySupport,
    TransportError, TransportKind,
};

use super::bluetooth::BluetoothTransport;
use super::mqtt::MqttTransport;

/// Either transport, dispatched by variant.
pub enum AnyTransport<A: SppAdapter, C: MqttConnector> {
    /// Classic Bluetooth serial link.
    Bluetooth(BluetoothTransport<A>),
    /// MQTT broker link.
    Mqtt(MqttTransport<C>),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            AnyTransport::Bluetooth($t) => $body,
            AnyTransport::Mqtt($t) => $body,
        }
    };
}

impl<A: SppAdapter, C: MqttConnector> AnyTransport<A, C> {
    /// The Bluetooth transport, if that is the variant.
    pub fn as_bluetooth(&self) -> Option<&BluetoothTransport<A>> {
        match self {
            Self::Bluetooth(t) => Some(t),
            Self::Mqtt(_) => None,
        }
    }

    /// The MQTT transport, if that is the variant.
    pub fn as_mqtt(&self) -> Option<&MqttTransport<C>> {
        match self {
            Self::Mqtt(t) => Some(t),
            Self::Bluetooth(_) => None,
        }
    }

    /// Watch the session state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        dispatch!(self, t => t.subscribe_state())
    }
}

impl<A: SppAdapter, C: MqttConnector> From<BluetoothTransport<A>> for AnyTransport<A, C> {
    fn from(t: BluetoothTransport<A>) -> Self {
        Self::Bluetooth(t)
    }
}

impl<A: SppAdapter, C: MqttConnector> From<MqttTransport<C>> for AnyTransport<A, C> {
    fn from(t: MqttTransport<C>) -> Self {
        Self::Mqtt(t)
    }
}

impl<A: SppAdapter, C: MqttConnector> MotorController for AnyTransport<A, C> {
    async fn connect(&self) -> Result<(), TransportError> {
        dispatch!(self, t => t.connect().await)
    }

    async fn disconnect(&self) {
        dispatch!(self, t => t.disconnect().await)
    }

    async fn send_soft_start(&self, values: [i32; STEP_COUNT]) -> Result<(), TransportError> {
        dispatch!(self, t => t.send_soft_start(values).await)
    }

    async fn send_continuous(&self) -> Result<(), TransportError> {
        dispatch!(self, t => t.send_continuous().await)
    }

    async fn send_stop(&self) -> Result<(), TransportError> {
        dispatch!(self, t => t.send_stop().await)
    }

    async fn send_command(&self, command: MotorCommand) -> Result<(), TransportError> {
        dispatch!(self, t => t.send_command(command).await)
    }

    fn on_speed(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        dispatch!(self, t => t.on_speed(callback))
    }

    fn on_status(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        dispatch!(self, t => t.on_status(callback))
    }

    fn on_current(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        dispatch!(self, t => t.on_current(callback))
    }

    fn on_voltage(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        dispatch!(self, t => t.on_voltage(callback))
    }

    fn on_mode(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        dispatch!(self, t => t.on_mode(callback))
    }

    fn telemetry_support(&self) -> TelemetrySupport {
        dispatch!(self, t => t.telemetry_support())
    }

    fn is_connected(&self) -> bool {
        dispatch!(self, t => t.is_connected())
    }

    fn connection_state(&self) -> ConnectionState {
        dispatch!(self, t => t.connection_state())
    }

    fn connection_info(&self) -> String {
        dispatch!(self, t => t.connection_info())
    }

    fn kind(&self) -> TransportKind {
        dispatch!(self, t => t.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BluetoothConfig, MqttConfig};
    use crate::hal::{MockMqttConnector, MockSppAdapter};
    use crate::traits::BluetoothDevice;
    use std::sync::Arc;

    type Link = AnyTransport<MockSppAdapter, MockMqttConnector>;

    #[test]
    fn variants_report_their_capabilities() {
        let bt: Link = BluetoothTransport::new(Arc::new(MockSppAdapter::new()), BluetoothConfig::default())
            .with_device(BluetoothDevice::new(Some("SoftStarter"), "00:11:22:33:44:55"))
            .into();
        assert_eq!(bt.kind(), TransportKind::Bluetooth);
        assert!(!bt.telemetry_support().current);
        assert!(bt.as_bluetooth().is_some());
        assert_eq!(bt.connection_info(), "SoftStarter (00:11:22:33:44:55)");

        let mqtt: Link = MqttTransport::new(MockMqttConnector::new(), MqttConfig::default()).into();
        assert_eq!(mqtt.kind(), TransportKind::Mqtt);
        assert!(mqtt.telemetry_support().voltage);
        assert!(mqtt.as_bluetooth().is_none());
        assert_eq!(mqtt.connection_info(), "tcp://192.168.1.100:1883");
    }

    #[tokio::test]
    async fn dispatches_to_the_inner_transport() {
        let connector = Arc::new(MockMqttConnector::new());
        let link: AnyTransport<MockSppAdapter, Arc<MockMqttConnector>> =
            MqttTransport::new(Arc::clone(&connector), MqttConfig::default()).into();
        link.connect().await.unwrap();
        assert_eq!(link.connection_state(), ConnectionState::Connected);

        link.send_command(MotorCommand::EmergencyStop).await.unwrap();
        assert_eq!(
            connector.client().published_to("motor/esp32_001/command"),
            vec!["0p".to_string()]
        );

        link.disconnect().await;
        assert!(!link.is_connected());
    }
}
