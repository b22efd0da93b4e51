//! `rumqttc` implementation of the MQTT primitives.
//!
//! Each session gets its own `AsyncClient` and a spawned task polling the
//! event loop. The task resolves the connect call once, on the first
//! `ConnAck` or the first error, forwards inbound publishes, and ends on
//! any connection error. Ending drops the inbound sender, which is how the
//! transport learns the connection was lost.
//!
//! After [`MqttClient::disconnect`] the task keeps running until the queued
//! unsubscribes and the DISCONNECT packet are on the wire, bounded by
//! [`DISCONNECT_GRACE`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::traits::{
    ConnectOptions, MqttClient, MqttConnector, MqttMessage, MqttSession, TransportError,
};

/// Outbound queue depth of each client.
const REQUEST_CAPACITY: usize = 32;

/// How long a closed session may keep flushing before its task is aborted.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Opens sessions with `rumqttc`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

/// Client handle for one `rumqttc` session.
pub struct RumqttcClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: AtomicBool,
    event_loop: JoinHandle<()>,
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        retire_event_loop(&self.event_loop, self.closing.load(Ordering::SeqCst));
    }
}

/// Abort `task` now, or after [`DISCONNECT_GRACE`] if it is `draining`
/// a disconnect and a runtime is around to wait on.
fn retire_event_loop(task: &JoinHandle<()>, draining: bool) {
    if task.is_finished() {
        return;
    }
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) if draining => runtime,
        _ => {
            task.abort();
            return;
        }
    };
    let handle = task.abort_handle();
    runtime.spawn(async move {
        tokio::time::sleep(DISCONNECT_GRACE).await;
        if !handle.is_finished() {
            debug!("mqtt event loop still flushing, aborting");
            handle.abort();
        }
    });
}

impl MqttClient for RumqttcClient {
    type Error = ClientError;

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
    }

    fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.try_subscribe(topic, QoS::AtLeastOnce)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.try_unsubscribe(topic)
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.try_disconnect()?;
        self.closing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let endpoint = &options.endpoint;
    let mut mqtt = MqttOptions::new(&options.client_id, &endpoint.host, endpoint.port);
    mqtt.set_keep_alive(options.keep_alive);
    if let Some(creds) = &options.credentials {
        mqtt.set_credentials(&creds.username, &creds.password);
    }
    if endpoint.is_tls() {
        mqtt.set_transport(Transport::tls_with_default_config());
    }
    mqtt
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    ack: oneshot::Sender<Result<(), TransportError>>,
    incoming: mpsc::UnboundedSender<MqttMessage>,
    connected: Arc<AtomicBool>,
) {
    let mut ack = Some(ack);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = ack.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let reason = format!("broker refused connection: {:?}", connack.code);
                    if let Some(tx) = ack.take() {
                        let _ = tx.send(Err(TransportError::Connect(reason)));
                    }
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MqttMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if incoming.send(message).is_err() {
                    // Dispatcher gone; a queued disconnect still has to go out
                    debug!("dropping publish on {}", publish.topic);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                match ack.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(TransportError::Connect(e.to_string())));
                    }
                    None => warn!("mqtt event loop error: {}", e),
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

impl MqttConnector for RumqttcConnector {
    type Client = RumqttcClient;

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<MqttSession<RumqttcClient>, TransportError> {
        let (client, event_loop) = AsyncClient::new(mqtt_options(options), REQUEST_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_event_loop(
            event_loop,
            ack_tx,
            incoming_tx,
            Arc::clone(&connected),
        ));
        let client = RumqttcClient {
            client,
            connected,
            closing: AtomicBool::new(false),
            event_loop: task,
        };

        // Dropping `client` on the error paths aborts the event loop task
        match tokio::time::timeout(options.connect_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(MqttSession { client, incoming }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::Connect("event loop ended".to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_task(done: &Arc<AtomicBool>, after: Duration) -> JoinHandle<()> {
        let done = Arc::clone(done);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            done.store(true, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn draining_loop_gets_to_finish() {
        let done = Arc::new(AtomicBool::new(false));
        let task = slow_task(&done, Duration::from_millis(300));
        retire_event_loop(&task, true);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn draining_is_bounded() {
        let done = Arc::new(AtomicBool::new(false));
        let task = slow_task(&done, DISCONNECT_GRACE * 3);
        retire_event_loop(&task, true);

        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_is_aborted_at_once() {
        let done = Arc::new(AtomicBool::new(false));
        let task = slow_task(&done, Duration::from_millis(10));
        retire_event_loop(&task, false);

        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!done.load(Ordering::SeqCst));
    }
}
