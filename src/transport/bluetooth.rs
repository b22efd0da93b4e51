//! Classic Bluetooth (SPP) transport.
//!
//! The device speaks raw ASCII over an RFCOMM stream. There is no separate
//! telemetry channel: every read is handed to the raw-data callback and its
//! first byte is decoded as a marker-offset speed, from which a synthetic
//! `running`/`stopped` status is derived. Current, voltage and mode are never
//! reported.
//!
//! Soft-start steps are streamed one token per write, in index order, with
//! [`BluetoothConfig::step_delay`] between writes.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ConnectGuard;
use crate::config::BluetoothConfig;
use crate::protocol::{decode_speed, encode_continuous, encode_soft_start, encode_stop, STEP_COUNT};
use crate::telemetry::TelemetryCallbacks;
use crate::traits::{
    BluetoothDevice, ConnectionState, DiscoveryEvent, MotorController, SppAdapter,
    TransportError, TransportKind, SPP_UUID,
};

// ============================================================================
// Transport
// ============================================================================

/// Motor link over a Bluetooth serial port.
pub struct BluetoothTransport<A: SppAdapter> {
    adapter: Arc<A>,
    config: BluetoothConfig,
    device: Mutex<Option<BluetoothDevice>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<A::Stream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    callbacks: Arc<TelemetryCallbacks>,
    connecting: AtomicBool,
}

impl<A: SppAdapter> BluetoothTransport<A> {
    /// Create a transport over `adapter`. No device is selected yet.
    pub fn new(adapter: Arc<A>, config: BluetoothConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            adapter,
            config,
            device: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            state: Arc::new(state),
            callbacks: Arc::new(TelemetryCallbacks::new()),
            connecting: AtomicBool::new(false),
        }
    }

    /// Select the device the next [`connect`](MotorController::connect) opens.
    pub fn with_device(self, device: BluetoothDevice) -> Self {
        self.select_device(device);
        self
    }

    /// Select the device the next connect opens.
    pub fn select_device(&self, device: BluetoothDevice) {
        *self.device.lock() = Some(device);
    }

    /// Currently selected device.
    pub fn device(&self) -> Option<BluetoothDevice> {
        self.device.lock().clone()
    }

    /// Register the raw-data callback, fired once per non-empty read.
    pub fn on_raw_data(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.set_raw(callback);
    }

    /// Watch the session state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Start inquiry. `on_found` fires once per newly seen address.
    pub async fn discover(
        &self,
        on_found: impl Fn(&BluetoothDevice) + Send + Sync + 'static,
    ) -> Result<BluetoothDiscovery, TransportError> {
        BluetoothDiscovery::start(Arc::clone(&self.adapter), on_found).await
    }

    async fn open_with_retry(&self, device: &BluetoothDevice) -> Result<A::Stream, TransportError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = TransportError::Connect("no attempt made".to_string());
        for attempt in 1..=attempts {
            match self.adapter.open_rfcomm(&device.address, SPP_UUID).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(
                        "bluetooth connect to {} failed (attempt {}/{}): {}",
                        device.address, attempt, attempts, e
                    );
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn close_session(&self) {
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
            // Wait so the read half is dropped before we return
            let _ = handle.await;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("bluetooth shutdown: {}", e);
            }
        }
    }

    async fn write_tokens<'a>(
        &self,
        tokens: impl Iterator<Item = &'a str>,
    ) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        for (i, token) in tokens.enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.step_delay()).await;
            }
            let written = async {
                writer.write_all(token.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!("bluetooth write failed: {}", e);
                self.state.send_replace(ConnectionState::Error(e.to_string()));
                return Err(TransportError::Io(e.to_string()));
            }
        }
        Ok(())
    }
}

/// Decode one read and fire the telemetry callbacks.
fn handle_frame(callbacks: &TelemetryCallbacks, frame: &[u8]) {
    callbacks.emit_raw(frame);
    match decode_speed(frame) {
        Some(speed) => {
            callbacks.emit_speed(i32::from(speed));
            callbacks.emit_status(if speed > 0 { "running" } else { "stopped" });
        }
        None => debug!("ignoring undecodable frame {:02x?}", frame),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    buffer_size: usize,
    callbacks: Arc<TelemetryCallbacks>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("bluetooth stream closed by peer");
                break;
            }
            Ok(n) => handle_frame(&callbacks, &buf[..n]),
            Err(e) => {
                debug!("bluetooth read loop ended: {}", e);
                break;
            }
        }
    }
    state.send_replace(ConnectionState::Disconnected);
}

impl<A: SppAdapter> MotorController for BluetoothTransport<A> {
    async fn connect(&self) -> Result<(), TransportError> {
        let device = self.device().ok_or(TransportError::NoDevice)?;
        let _guard = ConnectGuard::acquire(&self.connecting, &self.state)
            .ok_or(TransportError::AlreadyConnecting)?;

        self.close_session().await;
        self.state.send_replace(ConnectionState::Connecting);
        let result = self.open_with_retry(&device).await;

        match result {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                *self.writer.lock().await = Some(write_half);
                self.state.send_replace(ConnectionState::Connected);
                let handle = tokio::spawn(read_loop(
                    read_half,
                    self.config.read_buffer_size,
                    Arc::clone(&self.callbacks),
                    Arc::clone(&self.state),
                ));
                *self.reader.lock() = Some(handle);
                info!("bluetooth connected to {}", device);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.close_session().await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn send_soft_start(&self, values: [i32; STEP_COUNT]) -> Result<(), TransportError> {
        let payload = encode_soft_start(&values);
        self.write_tokens(payload.split(',')).await
    }

    async fn send_continuous(&self) -> Result<(), TransportError> {
        self.write_tokens(std::iter::once(encode_continuous())).await
    }

    async fn send_stop(&self) -> Result<(), TransportError> {
        self.write_tokens(std::iter::once(encode_stop())).await
    }

    fn on_speed(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        self.callbacks.set_speed(callback);
    }

    fn on_status(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.set_status(callback);
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn connection_info(&self) -> String {
        match self.device() {
            Some(device) => device.to_string(),
            None => "no device selected".to_string(),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }
}

// ============================================================================
// Discovery session
// ============================================================================

type FoundCallback = Arc<dyn Fn(&BluetoothDevice) + Send + Sync>;

/// One inquiry run.
///
/// Each address is reported once. The session ends when the adapter reports
/// [`DiscoveryEvent::Finished`], when [`cancel`](Self::cancel) is called or
/// when the session is dropped; in every case the adapter's inquiry is
/// stopped.
pub struct BluetoothDiscovery {
    devices: Arc<watch::Sender<Vec<BluetoothDevice>>>,
    finished: watch::Receiver<bool>,
    cancel: CancellationToken,
    // Held while a device is recorded; cancel() takes it so no event
    // recorded concurrently can land after cancel returns.
    gate: Arc<ReentrantMutex<()>>,
}

impl BluetoothDiscovery {
    async fn start<A: SppAdapter>(
        adapter: Arc<A>,
        on_found: impl Fn(&BluetoothDevice) + Send + Sync + 'static,
    ) -> Result<Self, TransportError> {
        let mut events = adapter.start_discovery().await?;
        let (devices, _) = watch::channel(Vec::new());
        let devices = Arc::new(devices);
        let (finished_tx, finished) = watch::channel(false);
        let cancel = CancellationToken::new();
        let gate = Arc::new(ReentrantMutex::new(()));
        let on_found: FoundCallback = Arc::new(on_found);

        let task_devices = Arc::clone(&devices);
        let task_cancel = cancel.clone();
        let task_gate = Arc::clone(&gate);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(DiscoveryEvent::DeviceFound(device)) => {
                            if !record_device(&task_gate, &task_cancel, &task_devices, &on_found, device) {
                                break;
                            }
                        }
                        Some(DiscoveryEvent::Finished) | None => break,
                    },
                }
            }
            adapter.stop_discovery().await;
            debug!("bluetooth discovery finished");
            let _ = finished_tx.send(true);
        });

        Ok(Self {
            devices,
            finished,
            cancel,
            gate,
        })
    }

    /// Devices seen so far, in discovery order.
    pub fn devices(&self) -> Vec<BluetoothDevice> {
        self.devices.borrow().clone()
    }

    /// Watch the device list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<BluetoothDevice>> {
        self.devices.subscribe()
    }

    /// Stop the session. No device is recorded or reported after this
    /// returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
        drop(self.gate.lock());
    }

    /// Whether the session has ended and the adapter was told to stop.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the session has ended.
    pub async fn finished(&self) {
        let mut rx = self.finished.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Drop for BluetoothDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Record a device if it is new. Returns `false` once the session is cancelled.
fn record_device(
    gate: &ReentrantMutex<()>,
    cancel: &CancellationToken,
    devices: &watch::Sender<Vec<BluetoothDevice>>,
    on_found: &FoundCallback,
    device: BluetoothDevice,
) -> bool {
    let _held = gate.lock();
    if cancel.is_cancelled() {
        return false;
    }
    let added = devices.send_if_modified(|list| {
        if list.iter().any(|d| d.address == device.address) {
            false
        } else {
            list.push(device.clone());
            true
        }
    });
    if added {
        on_found(&device);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_speed;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn frame_decoding_drives_speed_and_status() {
        let callbacks = TelemetryCallbacks::new();
        let speed = Arc::new(AtomicI32::new(-1));
        let status = Arc::new(Mutex::new(String::new()));
        let raw_hits = Arc::new(AtomicI32::new(0));

        let s = Arc::clone(&speed);
        callbacks.set_speed(move |v| s.store(v, Ordering::SeqCst));
        let st = Arc::clone(&status);
        callbacks.set_status(move |v| *st.lock() = v.to_string());
        let r = Arc::clone(&raw_hits);
        callbacks.set_raw(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        handle_frame(&callbacks, &[encode_speed(100).unwrap()]);
        assert_eq!(speed.load(Ordering::SeqCst), 100);
        assert_eq!(*status.lock(), "running");

        handle_frame(&callbacks, &[0xD0]);
        assert_eq!(speed.load(Ordering::SeqCst), 0);
        assert_eq!(*status.lock(), "stopped");

        // Undecodable: raw still fires, speed keeps its last value
        handle_frame(&callbacks, &[0xCF]);
        assert_eq!(speed.load(Ordering::SeqCst), 0);
        assert_eq!(raw_hits.load(Ordering::SeqCst), 3);
    }
}
