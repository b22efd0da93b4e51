//! Mock implementations for testing without a radio, broker or device.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockSppAdapter`] | [`SppAdapter`] | In-memory RFCOMM streams, scripted discovery |
//! | [`MockMqtt`] | [`MqttClient`] | Records publishes and live subscriptions |
//! | [`MockMqttConnector`] | [`MqttConnector`] | Hands out a [`MockMqtt`], injects messages |
//! | [`MockDeviceHttp`] | [`DeviceHttp`] | Scriptable ESP32 web API |
//! | [`MockWifi`] | [`WifiInfo`] | Settable SSID, scan results and address |
//! | [`MockFallback`] | [`FallbackDiscovery`] | Fixed fallback answer |
//! | [`MockAudit`] | [`CommandAudit`] | Records audited commands |
//!
//! All mocks use interior mutability so a test can keep an `Arc` handle
//! while the code under test owns another.
//!
//! # Example
//!
//! ```rust
//! use rs_softstart::hal::MockMqtt;
//! use rs_softstart::traits::MqttClient;
//!
//! let mqtt = MockMqtt::new();
//! mqtt.subscribe("motor/esp32_001/speed").unwrap();
//! mqtt.publish("motor/esp32_001/command", b"0p", false).unwrap();
//!
//! assert!(mqtt.is_subscribed("motor/esp32_001/speed"));
//! assert_eq!(mqtt.published_to("motor/esp32_001/command"), vec!["0p".to_string()]);
//! ```
//!
//! [`SppAdapter`]: crate::traits::SppAdapter
//! [`MqttClient`]: crate::traits::MqttClient
//! [`MqttConnector`]: crate::traits::MqttConnector
//! [`DeviceHttp`]: crate::traits::DeviceHttp
//! [`WifiInfo`]: crate::traits::WifiInfo
//! [`FallbackDiscovery`]: crate::traits::FallbackDiscovery
//! [`CommandAudit`]: crate::traits::CommandAudit

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::protocol::MotorCommand;
use crate::traits::{
    ApiError, BluetoothDevice, CommandAudit, ConfigureResponse, ConnectOptions, DeviceHttp,
    DeviceHttpError, DeviceStatus, DiscoveryEvent, FallbackDiscovery, MqttClient, MqttConnector,
    MqttMessage, MqttSession, ProbeReply, SppAdapter, TransportError, WifiCredentials, WifiError,
    WifiInfo, WifiNetwork,
};

/// Ordered log of lifecycle events shared between mocks.
///
/// Lets a test assert that one transport closed before another opened.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Create an empty [`EventLog`].
pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn log_event(log: &Mutex<Option<EventLog>>, event: String) {
    if let Some(log) = log.lock().as_ref() {
        log.lock().push(event);
    }
}

// ============================================================================
// Bluetooth Mocks
// ============================================================================

/// One end of an in-memory RFCOMM link.
///
/// Dropping it decrements the adapter's live stream count.
#[derive(Debug)]
pub struct MockSppStream {
    inner: DuplexStream,
    address: String,
    live: Arc<AtomicUsize>,
    log: Option<EventLog>,
}

impl Drop for MockSppStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().push(format!("bt close {}", self.address));
        }
    }
}

impl AsyncRead for MockSppStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockSppStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Mock Bluetooth adapter.
///
/// Every successful [`open_rfcomm`](SppAdapter::open_rfcomm) creates an
/// in-memory duplex pair; the device end is queued for
/// [`take_peer`](Self::take_peer).
#[derive(Debug, Default)]
pub struct MockSppAdapter {
    fail_opens: AtomicUsize,
    open_attempts: AtomicUsize,
    live: Arc<AtomicUsize>,
    peers: Mutex<VecDeque<DuplexStream>>,
    discovery: Mutex<Option<mpsc::Sender<DiscoveryEvent>>>,
    discovery_stops: AtomicUsize,
    log: Mutex<Option<EventLog>>,
}

impl MockSppAdapter {
    /// Creates an adapter whose opens succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record lifecycle events into `log`.
    pub fn with_log(self, log: EventLog) -> Self {
        *self.log.lock() = Some(log);
        self
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Total open attempts so far.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Streams currently open on the host side.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Device end of the oldest open link.
    pub fn take_peer(&self) -> Option<DuplexStream> {
        self.peers.lock().pop_front()
    }

    /// Deliver a discovery event. Returns `false` if no inquiry is running.
    pub fn emit(&self, event: DiscoveryEvent) -> bool {
        match self.discovery.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a device-found event.
    pub fn emit_device(&self, name: &str, address: &str) -> bool {
        self.emit(DiscoveryEvent::DeviceFound(BluetoothDevice::new(
            Some(name),
            address,
        )))
    }

    /// How many times inquiry was stopped.
    pub fn discovery_stops(&self) -> usize {
        self.discovery_stops.load(Ordering::SeqCst)
    }

    /// Whether an inquiry is running.
    pub fn is_discovering(&self) -> bool {
        self.discovery.lock().is_some()
    }
}

impl SppAdapter for MockSppAdapter {
    type Stream = MockSppStream;

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        *self.discovery.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop_discovery(&self) {
        self.discovery.lock().take();
        self.discovery_stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn open_rfcomm(&self, address: &str, _service: Uuid) -> Result<MockSppStream, TransportError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect(format!("{} did not answer", address)));
        }
        let (host, device) = tokio::io::duplex(4096);
        self.peers.lock().push_back(device);
        self.live.fetch_add(1, Ordering::SeqCst);
        log_event(&self.log, format!("bt open {}", address));
        Ok(MockSppStream {
            inner: host,
            address: address.to_string(),
            live: Arc::clone(&self.live),
            log: self.log.lock().clone(),
        })
    }
}

// ============================================================================
// MQTT Mocks
// ============================================================================

#[derive(Debug, Default)]
struct MockMqttInner {
    published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    subscriptions: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    refused_topic: Mutex<Option<String>>,
    log: Mutex<Option<EventLog>>,
}

/// Mock MQTT client.
///
/// Cloning shares the same recorded state.
#[derive(Clone, Debug, Default)]
pub struct MockMqtt {
    inner: Arc<MockMqttInner>,
}

impl MockMqtt {
    /// Client that starts out connected.
    pub fn new() -> Self {
        let mqtt = Self::default();
        mqtt.set_connected(true);
        mqtt
    }

    /// Flip the connection flag.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Make publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make subscriptions to `topic` fail.
    pub fn refuse_subscription(&self, topic: &str) {
        *self.inner.refused_topic.lock() = Some(topic.to_string());
    }

    /// Whether `topic` has a live subscription.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.subscriptions.lock().contains(topic)
    }

    /// Currently subscribed topics, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    /// All publishes as (topic, payload, retain).
    pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.inner.published.lock().clone()
    }

    /// Payloads published to a topic, as text
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

impl MqttClient for MockMqtt {
    type Error = String;

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), String> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err("publish rejected".to_string());
        }
        self.inner
            .published
            .lock()
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), String> {
        if self.inner.refused_topic.lock().as_deref() == Some(topic) {
            return Err(format!("subscription to {} refused", topic));
        }
        self.inner.subscriptions.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), String> {
        self.inner.subscriptions.lock().remove(topic);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), String> {
        self.set_connected(false);
        log_event(&self.inner.log, "mqtt disconnect".to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// Mock broker connector.
///
/// Every connect hands out the same [`MockMqtt`] handle and a fresh inbound
/// queue that [`inject`](Self::inject) feeds.
#[derive(Debug, Default)]
pub struct MockMqttConnector {
    client: MockMqtt,
    incoming: Mutex<Option<mpsc::UnboundedSender<MqttMessage>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    fail: AtomicBool,
    connects: AtomicUsize,
    last_options: Mutex<Option<ConnectOptions>>,
    log: Mutex<Option<EventLog>>,
}

impl MockMqttConnector {
    /// Creates a connector whose connects succeed immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record lifecycle events into `log` (the client shares it).
    pub fn with_log(self, log: EventLog) -> Self {
        *self.client.inner.log.lock() = Some(Arc::clone(&log));
        *self.log.lock() = Some(log);
        self
    }

    /// Hold every connect until the returned handle is notified.
    pub fn hold_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Stop holding connects started from now on.
    pub fn release_connects(&self) {
        self.gate.lock().take();
    }

    /// Make connects fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The client handle given to the transport.
    pub fn client(&self) -> MockMqtt {
        self.client.clone()
    }

    /// Number of connect calls.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Options of the last connect call.
    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().clone()
    }

    /// Deliver an inbound publish. Returns `false` when no session is open.
    pub fn inject(&self, topic: &str, payload: &str) -> bool {
        match self.incoming.lock().as_ref() {
            Some(tx) => tx.send(MqttMessage::new(topic, payload)).is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        self.client.set_connected(false);
        self.incoming.lock().take();
    }
}

impl MqttConnector for MockMqttConnector {
    type Client = MockMqtt;

    async fn connect(&self, options: &ConnectOptions) -> Result<MqttSession<MockMqtt>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        log_event(&self.log, format!("mqtt connect {}", options.endpoint));
        let (tx, incoming) = mpsc::unbounded_channel();
        *self.incoming.lock() = Some(tx);
        self.client.set_connected(true);
        Ok(MqttSession {
            client: self.client.clone(),
            incoming,
        })
    }
}

// ============================================================================
// Device Mocks
// ============================================================================

/// Identity banner served by a mock ESP32.
pub const MOCK_DEVICE_BANNER: &str = "<html><title>ESP32 SoftStarter</title></html>";

/// Scriptable ESP32 web API.
///
/// Addresses are either dead, alive (ping only) or alive with a probe
/// banner. `joins_network_at` makes the device appear at a station address
/// once credentials were pushed.
#[derive(Debug, Default)]
pub struct MockDeviceHttp {
    alive: Mutex<HashSet<String>>,
    banners: Mutex<HashMap<String, ProbeReply>>,
    statuses: Mutex<HashMap<String, DeviceStatus>>,
    configure_response: Mutex<Option<Result<ConfigureResponse, DeviceHttpError>>>,
    configure_delay: Mutex<Option<Duration>>,
    join_ip: Mutex<Option<String>>,
    configured: Mutex<Vec<(String, String, String)>>,
    pings: Mutex<Vec<String>>,
    restarts: AtomicUsize,
}

impl MockDeviceHttp {
    /// Creates an API where nothing answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ip` answer pings (no banner).
    pub fn set_alive(&self, ip: &str, alive: bool) {
        if alive {
            self.alive.lock().insert(ip.to_string());
        } else {
            self.alive.lock().remove(ip);
        }
    }

    /// Put a soft-starter at `ip`.
    pub fn add_device(&self, ip: &str) {
        self.set_banner(
            ip,
            ProbeReply {
                body: MOCK_DEVICE_BANNER.to_string(),
                server: Some("esp-httpd".to_string()),
            },
        );
    }

    /// Put some other web server at `ip`.
    pub fn add_foreign_host(&self, ip: &str) {
        self.set_banner(
            ip,
            ProbeReply {
                body: "<title>Router login</title>".to_string(),
                server: Some("lighttpd".to_string()),
            },
        );
    }

    fn set_banner(&self, ip: &str, reply: ProbeReply) {
        self.set_alive(ip, true);
        self.banners.lock().insert(ip.to_string(), reply);
    }

    /// Status returned for `ip`.
    pub fn set_status(&self, ip: &str, status: DeviceStatus) {
        self.statuses.lock().insert(ip.to_string(), status);
    }

    /// Answer to the next configure calls.
    pub fn set_configure_response(&self, response: Result<ConfigureResponse, DeviceHttpError>) {
        *self.configure_response.lock() = Some(response);
    }

    /// Delay before answering configure calls.
    pub fn set_configure_delay(&self, delay: Duration) {
        *self.configure_delay.lock() = Some(delay);
    }

    /// After a successful configure, the device shows up at `ip`.
    pub fn joins_network_at(&self, ip: &str) {
        *self.join_ip.lock() = Some(ip.to_string());
    }

    /// Configure calls as (ip, ssid, password).
    pub fn configure_calls(&self) -> Vec<(String, String, String)> {
        self.configured.lock().clone()
    }

    /// Addresses pinged so far, in order.
    pub fn pings(&self) -> Vec<String> {
        self.pings.lock().clone()
    }

    /// Number of restart calls.
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    fn is_alive(&self, ip: &str) -> bool {
        self.alive.lock().contains(ip)
    }
}

impl DeviceHttp for MockDeviceHttp {
    async fn ping(&self, ip: &str, _timeout: Duration) -> bool {
        self.pings.lock().push(ip.to_string());
        self.is_alive(ip)
    }

    async fn probe(&self, ip: &str, _timeout: Duration) -> Option<ProbeReply> {
        if !self.is_alive(ip) {
            return None;
        }
        Some(self.banners.lock().get(ip).cloned().unwrap_or_default())
    }

    async fn configure(
        &self,
        ip: &str,
        credentials: &WifiCredentials,
        _timeout: Duration,
    ) -> Result<ConfigureResponse, DeviceHttpError> {
        let delay = *self.configure_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_alive(ip) {
            return Err(DeviceHttpError::Unreachable(ip.to_string()));
        }
        self.configured.lock().push((
            ip.to_string(),
            credentials.ssid.clone(),
            String::clone(&credentials.password),
        ));
        let response = self.configure_response.lock().clone().unwrap_or(Ok(ConfigureResponse {
            success: true,
            message: "WiFi configured, restarting".to_string(),
            data: None,
        }));
        if matches!(response, Ok(ConfigureResponse { success: true, .. })) {
            let join = self.join_ip.lock().clone();
            if let Some(join) = join {
                self.add_device(&join);
            }
        }
        response
    }

    async fn status(&self, ip: &str) -> Result<DeviceStatus, DeviceHttpError> {
        if !self.is_alive(ip) {
            return Err(DeviceHttpError::Unreachable(ip.to_string()));
        }
        Ok(self.statuses.lock().get(ip).cloned().unwrap_or_default())
    }

    async fn restart(&self, ip: &str) -> Result<(), DeviceHttpError> {
        if !self.is_alive(ip) {
            return Err(DeviceHttpError::Unreachable(ip.to_string()));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Host WiFi with settable answers.
#[derive(Debug, Default)]
pub struct MockWifi {
    ssid: Mutex<Option<String>>,
    networks: Mutex<Vec<WifiNetwork>>,
    ipv4: Mutex<Option<Ipv4Addr>>,
    fail_scan: AtomicBool,
}

impl MockWifi {
    /// Host joined to `ssid`.
    pub fn on_network(ssid: &str) -> Self {
        let wifi = Self::default();
        wifi.set_ssid(Some(ssid));
        wifi
    }

    /// Change the joined network (`None` = not joined).
    pub fn set_ssid(&self, ssid: Option<&str>) {
        *self.ssid.lock() = ssid.map(str::to_string);
    }

    /// Scan results.
    pub fn set_networks(&self, networks: Vec<WifiNetwork>) {
        *self.networks.lock() = networks;
    }

    /// Host address.
    pub fn set_ipv4(&self, ip: Option<Ipv4Addr>) {
        *self.ipv4.lock() = ip;
    }

    /// Make scans fail.
    pub fn set_fail_scan(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }
}

impl WifiInfo for MockWifi {
    async fn current_ssid(&self) -> Option<String> {
        self.ssid.lock().clone()
    }

    async fn scan(&self) -> Result<Vec<WifiNetwork>, WifiError> {
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(WifiError("radio off".to_string()));
        }
        Ok(self.networks.lock().clone())
    }

    async fn current_ipv4(&self) -> Option<Ipv4Addr> {
        *self.ipv4.lock()
    }
}

/// Fallback discovery with a fixed answer.
#[derive(Debug, Default)]
pub struct MockFallback {
    answer: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MockFallback {
    /// Fallback that finds nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fallback answering `ip`.
    pub fn answering(ip: &str) -> Self {
        let fallback = Self::default();
        *fallback.answer.lock() = Some(ip.to_string());
        fallback
    }

    /// Number of discover calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FallbackDiscovery for MockFallback {
    async fn discover(&self, _timeout: Duration) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().clone()
    }
}

// ============================================================================
// Audit Mock
// ============================================================================

/// Records audited commands.
#[derive(Debug, Default)]
pub struct MockAudit {
    recorded: Mutex<Vec<MotorCommand>>,
    fail: AtomicBool,
}

impl MockAudit {
    /// Audit that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make audit calls fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Commands recorded so far, including failed attempts.
    pub fn recorded(&self) -> Vec<MotorCommand> {
        self.recorded.lock().clone()
    }
}

impl CommandAudit for MockAudit {
    async fn record(&self, command: &MotorCommand) -> Result<(), ApiError> {
        self.recorded.lock().push(*command);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Status(503));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn spp_open_failures_then_success() {
        let adapter = MockSppAdapter::new();
        adapter.fail_next_opens(2);
        assert!(adapter.open_rfcomm("AA", Uuid::nil()).await.is_err());
        assert!(adapter.open_rfcomm("AA", Uuid::nil()).await.is_err());
        let mut stream = adapter.open_rfcomm("AA", Uuid::nil()).await.unwrap();
        assert_eq!(adapter.open_attempts(), 3);
        assert_eq!(adapter.live_streams(), 1);

        let mut peer = adapter.take_peer().unwrap();
        stream.write_all(b"0p").await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0p");

        drop(stream);
        assert_eq!(adapter.live_streams(), 0);
    }

    #[test]
    fn mqtt_tracks_live_subscriptions() {
        let mqtt = MockMqtt::new();
        mqtt.subscribe("a").unwrap();
        mqtt.subscribe("b").unwrap();
        mqtt.unsubscribe("a").unwrap();
        assert_eq!(mqtt.subscriptions(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn device_joins_after_configure() {
        let http = MockDeviceHttp::new();
        http.set_alive("192.168.4.1", true);
        http.joins_network_at("192.168.1.103");
        assert!(!http.ping("192.168.1.103", Duration::from_secs(1)).await);

        let creds = WifiCredentials::new("Home", "secret123").unwrap();
        let reply = http
            .configure("192.168.4.1", &creds, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(reply.success);
        assert!(http.ping("192.168.1.103", Duration::from_secs(1)).await);
        assert_eq!(http.configure_calls()[0].1, "Home");
    }
}
