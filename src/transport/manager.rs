//! The single active motor link.
//!
//! [`TransportManager`] owns at most one [`AnyTransport`]. Activating a new
//! one fully disconnects the previous one first, so sockets and broker
//! subscriptions are never open on two transports at once.
//!
//! # Redundant delivery
//!
//! After a command succeeds on the transport it is also handed to the
//! [`CommandAudit`] channel. That second leg is best effort: its failure is
//! logged and never changes the result of the send. A failed transport send
//! is not audited.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};

use crate::protocol::{MotorCommand, STEP_COUNT};
use crate::telemetry::TelemetryMonitor;
use crate::traits::{
    CommandAudit, ConnectionState, MotorController, MqttConnector, NoAudit, SppAdapter,
    TransportError, TransportKind,
};

use super::any::AnyTransport;

/// Owns the active transport and fans its telemetry into a monitor.
pub struct TransportManager<A: SppAdapter, C: MqttConnector, Au: CommandAudit = NoAudit> {
    active: Mutex<Option<AnyTransport<A, C>>>,
    audit: Option<Arc<Au>>,
    telemetry: TelemetryMonitor,
    kind: Arc<watch::Sender<Option<TransportKind>>>,
}

impl<A: SppAdapter, C: MqttConnector> TransportManager<A, C, NoAudit> {
    /// Manager without an audit channel.
    pub fn new() -> Self {
        Self::build(None)
    }
}

impl<A: SppAdapter, C: MqttConnector> Default for TransportManager<A, C, NoAudit> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: SppAdapter, C: MqttConnector, Au: CommandAudit> TransportManager<A, C, Au> {
    /// Manager that audits every successful send through `audit`.
    pub fn with_audit(audit: Arc<Au>) -> Self {
        Self::build(Some(audit))
    }

    fn build(audit: Option<Arc<Au>>) -> Self {
        let (kind, _) = watch::channel(None);
        Self {
            active: Mutex::new(None),
            audit,
            telemetry: TelemetryMonitor::new(),
            kind: Arc::new(kind),
        }
    }

    /// Merged telemetry of whichever transport is active.
    pub fn telemetry(&self) -> &TelemetryMonitor {
        &self.telemetry
    }

    /// Kind of the active transport, if any.
    pub fn active_kind(&self) -> Option<TransportKind> {
        *self.kind.borrow()
    }

    /// Watch the active transport kind.
    pub fn subscribe_kind(&self) -> watch::Receiver<Option<TransportKind>> {
        self.kind.subscribe()
    }

    /// Replace the active transport and connect it.
    ///
    /// The previous transport is disconnected before the new one connects.
    /// The new transport stays installed even if its connect fails, so
    /// [`reconnect`](Self::reconnect) can retry it.
    pub async fn activate(
        &self,
        transport: impl Into<AnyTransport<A, C>>,
    ) -> Result<(), TransportError> {
        let transport = transport.into();
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("closing {} transport", previous.kind().as_str());
            previous.disconnect().await;
        }

        self.telemetry.reset();
        self.telemetry.bind(&transport);
        let kind = transport.kind();
        self.kind.send_replace(Some(kind));

        let result = transport.connect().await;
        match &result {
            Ok(()) => info!("{} transport active: {}", kind.as_str(), transport.connection_info()),
            Err(e) => warn!("{} transport failed to connect: {}", kind.as_str(), e),
        }
        *active = Some(transport);
        result
    }

    /// Connect the installed transport again.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(transport) => transport.connect().await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Disconnect and drop the active transport.
    pub async fn deactivate(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.disconnect().await;
            info!("{} transport closed", previous.kind().as_str());
        }
        self.kind.send_replace(None);
    }

    /// Send a command on the active transport, then audit it.
    pub async fn send(&self, command: MotorCommand) -> Result<(), TransportError> {
        {
            let active = self.active.lock().await;
            let transport = active.as_ref().ok_or(TransportError::NotConnected)?;
            transport.send_command(command).await?;
        }
        if let Some(audit) = &self.audit {
            match audit.record(&command).await {
                Ok(()) => debug!("audited {}", command.type_label()),
                Err(e) => warn!("audit of {} failed: {}", command.type_label(), e),
            }
        }
        Ok(())
    }

    /// Send a 6-step soft start.
    pub async fn send_soft_start(&self, values: [i32; STEP_COUNT]) -> Result<(), TransportError> {
        self.send(MotorCommand::soft_start(values)).await
    }

    /// Send a continuous start.
    pub async fn send_continuous(&self) -> Result<(), TransportError> {
        self.send(MotorCommand::ContinuousStart).await
    }

    /// Send an emergency stop.
    pub async fn send_stop(&self) -> Result<(), TransportError> {
        self.send(MotorCommand::EmergencyStop).await
    }

    /// Switch the MQTT device namespace. Errors if MQTT is not active.
    pub async fn set_device_id(&self, device_id: &str) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        match active.as_ref().and_then(AnyTransport::as_mqtt) {
            Some(mqtt) => mqtt.set_device_id(device_id).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Whether the active transport is connected.
    pub async fn is_connected(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    /// State of the active transport.
    pub async fn connection_state(&self) -> ConnectionState {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|t| t.connection_state())
            .unwrap_or_default()
    }

    /// Descriptor of the active link.
    pub async fn connection_info(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|t| t.connection_info())
    }
}
