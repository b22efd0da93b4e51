//! MQTT transport.
//!
//! One broker session multiplexes command publishing and telemetry
//! subscriptions under a per-device namespace:
//!
//! **Publish Topics:**
//! - `<prefix>/<device>/command` - ASCII motor command
//! - `<prefix>/<device>/type` - command label (`arranque6p`, `continuo`, `paro`)
//!
//! **Subscribe Topics:**
//! - `<prefix>/<device>/{type,speed,state,current,voltage,raw}`
//!
//! A send is two fire-and-forget publishes, command first then type. They
//! are not atomic: if the second fails the first has already left.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::protocol::{MotorCommand, STEP_COUNT};
use crate::telemetry::TelemetryCallbacks;
use super::ConnectGuard;
use crate::traits::{
    ConnectOptions, ConnectionState, MotorController, MqttClient, MqttConnector, MqttMessage,
    TelemetrySupport, TransportError, TransportKind,
};

/// Leaf the command string is published to.
pub const COMMAND_LEAF: &str = "command";

/// Leaf the command label is published to.
pub const TYPE_LEAF: &str = "type";

/// Leaves subscribed for telemetry. `command` is publish-only.
pub const TELEMETRY_LEAVES: [&str; 6] = ["type", "speed", "state", "current", "voltage", "raw"];

/// Build `<prefix>/<device>/<leaf>`.
pub fn device_topic(prefix: &str, device_id: &str, leaf: &str) -> String {
    format!("{}/{}/{}", prefix, device_id, leaf)
}

/// Route one inbound message to the telemetry callbacks by its last topic
/// segment. Unparseable numeric payloads are dropped.
pub fn dispatch_message(callbacks: &TelemetryCallbacks, message: &MqttMessage) {
    let Some(text) = message.payload_str() else {
        debug!("non-UTF-8 payload on {}", message.topic);
        return;
    };
    match message.leaf() {
        "speed" => match text.trim().parse::<i32>() {
            Ok(speed) => callbacks.emit_speed(speed),
            Err(_) => debug!("bad speed payload {:?}", text),
        },
        "state" | "type" => callbacks.emit_status(text),
        "current" => match text.trim().parse::<f32>() {
            Ok(current) => callbacks.emit_current(current),
            Err(_) => debug!("bad current payload {:?}", text),
        },
        "voltage" => match text.trim().parse::<f32>() {
            Ok(voltage) => callbacks.emit_voltage(voltage),
            Err(_) => debug!("bad voltage payload {:?}", text),
        },
        "raw" => debug!("raw telemetry on {}: {}", message.topic, text),
        other => debug!("ignoring message on leaf {:?}", other),
    }
}

struct ActiveSession<C> {
    client: Arc<C>,
    device_id: String,
    dispatcher: JoinHandle<()>,
}

/// Motor link over an MQTT broker.
pub struct MqttTransport<C: MqttConnector> {
    connector: C,
    config: MqttConfig,
    client_id: String,
    device_id: Mutex<String>,
    session: tokio::sync::Mutex<Option<ActiveSession<C::Client>>>,
    subscribed: Mutex<Vec<String>>,
    state: Arc<watch::Sender<ConnectionState>>,
    callbacks: Arc<TelemetryCallbacks>,
    connecting: AtomicBool,
}

impl<C: MqttConnector> MqttTransport<C> {
    /// Create a transport. The client id is `<prefix>-<uuid>`.
    pub fn new(connector: C, config: MqttConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            client_id: format!("{}-{}", config.topic_prefix, Uuid::new_v4()),
            device_id: Mutex::new(config.device_id.clone()),
            config,
            session: tokio::sync::Mutex::new(None),
            subscribed: Mutex::new(Vec::new()),
            state: Arc::new(state),
            callbacks: Arc::new(TelemetryCallbacks::new()),
            connecting: AtomicBool::new(false),
        }
    }

    /// MQTT client id used for the session.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Device id used for topics.
    pub fn device_id(&self) -> String {
        self.device_id.lock().clone()
    }

    /// Topics with an active subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Watch the session state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn topic(&self, device_id: &str, leaf: &str) -> String {
        device_topic(&self.config.topic_prefix, device_id, leaf)
    }

    fn telemetry_topics(&self, device_id: &str) -> Vec<String> {
        TELEMETRY_LEAVES
            .iter()
            .map(|leaf| self.topic(device_id, leaf))
            .collect()
    }

    /// Switch the device namespace.
    ///
    /// While connected, the new topics are subscribed before the old ones
    /// are dropped, all under the session lock. If any subscription fails
    /// the session stays on the old device. While disconnected only the
    /// stored id changes.
    pub async fn set_device_id(&self, device_id: &str) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        let Some(active) = session.as_mut() else {
            *self.device_id.lock() = device_id.to_string();
            return Ok(());
        };
        if active.device_id == device_id {
            return Ok(());
        }

        let topics = Self::subscribe_all(&active.client, &self.telemetry_topics(device_id))?;
        Self::unsubscribe_all(&active.client, &self.telemetry_topics(&active.device_id));
        *self.subscribed.lock() = topics;
        active.device_id = device_id.to_string();
        *self.device_id.lock() = device_id.to_string();
        info!("mqtt switched to device {}", device_id);
        Ok(())
    }

    /// Subscribe to every topic, or to none: a failure undoes the ones
    /// already taken.
    fn subscribe_all(client: &C::Client, topics: &[String]) -> Result<Vec<String>, TransportError> {
        for (i, topic) in topics.iter().enumerate() {
            if let Err(e) = client.subscribe(topic) {
                Self::unsubscribe_all(client, &topics[..i]);
                return Err(TransportError::Subscribe(e.to_string()));
            }
        }
        Ok(topics.to_vec())
    }

    fn unsubscribe_all(client: &C::Client, topics: &[String]) {
        for topic in topics {
            if let Err(e) = client.unsubscribe(topic) {
                warn!("unsubscribe {} failed: {}", topic, e);
            }
        }
    }

    async fn close_session(&self, session: &mut Option<ActiveSession<C::Client>>) {
        let Some(active) = session.take() else {
            return;
        };
        Self::unsubscribe_all(&active.client, &self.telemetry_topics(&active.device_id));
        self.subscribed.lock().clear();
        if let Err(e) = active.client.disconnect() {
            warn!("mqtt disconnect failed: {}", e);
        }
        active.dispatcher.abort();
        let _ = active.dispatcher.await;
    }

    async fn publish_command(&self, command: MotorCommand) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let active = match session.as_ref() {
            Some(active) if active.client.is_connected() => active,
            _ => {
                warn!("dropping {} command: not connected", command.type_label());
                return Err(TransportError::NotConnected);
            }
        };
        let payload = command.encode();
        active
            .client
            .publish(&self.topic(&active.device_id, COMMAND_LEAF), payload.as_bytes(), false)
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        active
            .client
            .publish(
                &self.topic(&active.device_id, TYPE_LEAF),
                command.type_label().as_bytes(),
                false,
            )
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        debug!("published {} to device {}", payload, active.device_id);
        Ok(())
    }

    async fn open_session(&self) -> Result<ActiveSession<C::Client>, TransportError> {
        let options = ConnectOptions {
            endpoint: self.config.endpoint()?,
            client_id: self.client_id.clone(),
            keep_alive: self.config.keep_alive(),
            credentials: self.config.credentials(),
            connect_timeout: self.config.connect_timeout(),
        };
        let session = self.connector.connect(&options).await?;
        let client = Arc::new(session.client);
        let device_id = self.device_id();
        match Self::subscribe_all(&client, &self.telemetry_topics(&device_id)) {
            Ok(topics) => *self.subscribed.lock() = topics,
            Err(e) => {
                let _ = client.disconnect();
                return Err(e);
            }
        }
        let dispatcher = tokio::spawn(dispatch_loop(
            session.incoming,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.state),
        ));
        Ok(ActiveSession {
            client,
            device_id,
            dispatcher,
        })
    }
}

async fn dispatch_loop(
    mut incoming: mpsc::UnboundedReceiver<MqttMessage>,
    callbacks: Arc<TelemetryCallbacks>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(message) = incoming.recv().await {
        dispatch_message(&callbacks, &message);
    }
    warn!("mqtt connection lost");
    state.send_replace(ConnectionState::Disconnected);
}

impl<C: MqttConnector> MotorController for MqttTransport<C> {
    async fn connect(&self) -> Result<(), TransportError> {
        let _guard = ConnectGuard::acquire(&self.connecting, &self.state)
            .ok_or(TransportError::AlreadyConnecting)?;
        let mut session = self.session.lock().await;
        self.close_session(&mut session).await;
        self.state.send_replace(ConnectionState::Connecting);

        match self.open_session().await {
            Ok(active) => {
                *session = Some(active);
                self.state.send_replace(ConnectionState::Connected);
                info!("mqtt connected to {} as {}", self.config.broker, self.client_id);
                Ok(())
            }
            Err(e) => {
                warn!("mqtt connect to {} failed: {}", self.config.broker, e);
                self.state.send_replace(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.close_session(&mut session).await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn send_soft_start(&self, values: [i32; STEP_COUNT]) -> Result<(), TransportError> {
        self.publish_command(MotorCommand::soft_start(values)).await
    }

    async fn send_continuous(&self) -> Result<(), TransportError> {
        self.publish_command(MotorCommand::ContinuousStart).await
    }

    async fn send_stop(&self) -> Result<(), TransportError> {
        self.publish_command(MotorCommand::EmergencyStop).await
    }

    fn on_speed(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        self.callbacks.set_speed(callback);
    }

    fn on_status(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.set_status(callback);
    }

    fn on_current(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        self.callbacks.set_current(callback);
    }

    fn on_voltage(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        self.callbacks.set_voltage(callback);
    }

    fn telemetry_support(&self) -> TelemetrySupport {
        TelemetrySupport::ELECTRICAL
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn connection_info(&self) -> String {
        match self.config.endpoint() {
            Ok(endpoint) => endpoint.to_string(),
            Err(_) => self.config.broker.clone(),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    // ========================================================================
    // Topic helpers
    // ========================================================================

    #[test]
    fn topics_are_device_scoped() {
        assert_eq!(device_topic("motor", "esp32_001", "speed"), "motor/esp32_001/speed");
        assert!(!TELEMETRY_LEAVES.contains(&COMMAND_LEAF));
        assert_eq!(TELEMETRY_LEAVES.len(), 6);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    #[test]
    fn dispatch_routes_by_leaf() {
        let callbacks = TelemetryCallbacks::new();
        let speed = Arc::new(AtomicI32::new(-1));
        let status = Arc::new(Mutex::new(Vec::<String>::new()));
        let voltage = Arc::new(Mutex::new(None::<f32>));

        let s = Arc::clone(&speed);
        callbacks.set_speed(move |v| s.store(v, Ordering::SeqCst));
        let st = Arc::clone(&status);
        callbacks.set_status(move |v| st.lock().push(v.to_string()));
        let vo = Arc::clone(&voltage);
        callbacks.set_voltage(move |v| *vo.lock() = Some(v));

        dispatch_message(&callbacks, &MqttMessage::new("motor/esp32_001/speed", "120"));
        dispatch_message(&callbacks, &MqttMessage::new("motor/esp32_001/state", "running"));
        dispatch_message(&callbacks, &MqttMessage::new("motor/esp32_001/type", "paro"));
        dispatch_message(&callbacks, &MqttMessage::new("motor/esp32_001/voltage", "229.5"));

        assert_eq!(speed.load(Ordering::SeqCst), 120);
        assert_eq!(*status.lock(), vec!["running".to_string(), "paro".to_string()]);
        assert_eq!(*voltage.lock(), Some(229.5));
    }

    #[test]
    fn dispatch_drops_bad_numbers() {
        let callbacks = TelemetryCallbacks::new();
        let hits = Arc::new(AtomicI32::new(0));
        let h = Arc::clone(&hits);
        callbacks.set_speed(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        callbacks.set_current(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        dispatch_message(&callbacks, &MqttMessage::new("motor/x/speed", "fast"));
        dispatch_message(&callbacks, &MqttMessage::new("motor/x/current", ""));
        dispatch_message(&callbacks, &MqttMessage::new("motor/x/speed", vec![0xFF, 0xFE]));
        dispatch_message(&callbacks, &MqttMessage::new("motor/x/raw", "d0"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
