//! Telemetry callbacks and the merged telemetry snapshot.
//!
//! Transports deliver telemetry as independent partial updates: a speed
//! here, a state string there, a current reading later. Two pieces live in
//! this module:
//!
//! - [`TelemetryCallbacks`]: the single-subscriber callback slots a transport
//!   fires into. Registering a callback replaces the previous one for that
//!   metric; the last registration wins.
//! - [`TelemetryMonitor`]: binds to a transport and merges every partial
//!   update into a [`TelemetrySample`] published on a replay-latest
//!   `watch` channel.
//!
//! # Example
//!
//! ```rust
//! use rs_softstart::telemetry::{TelemetrySample, TelemetryUpdate};
//!
//! let mut sample = TelemetrySample::default();
//! sample.apply(TelemetryUpdate::Speed(120));
//! sample.apply(TelemetryUpdate::Current(1.5));
//!
//! assert_eq!(sample.speed, 120);
//! assert_eq!(sample.current, Some(1.5));
//! assert_eq!(sample.state, "stopped");
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::traits::MotorController;

// ============================================================================
// Sample
// ============================================================================

/// Last known telemetry values, merged from partial updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Motor speed (0 to 254).
    pub speed: i32,
    /// Free-form state reported by the device ("running", "stopped", ...).
    pub state: String,
    /// Motor current in amperes, if the transport reports it.
    pub current: Option<f32>,
    /// Supply voltage in volts, if the transport reports it.
    pub voltage: Option<f32>,
    /// Operating mode, if the transport reports it.
    pub mode: Option<String>,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            speed: 0,
            state: "stopped".to_string(),
            current: None,
            voltage: None,
            mode: None,
        }
    }
}

/// One partial telemetry update.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryUpdate {
    /// New speed reading.
    Speed(i32),
    /// New state string.
    Status(String),
    /// New current reading (A).
    Current(f32),
    /// New voltage reading (V).
    Voltage(f32),
    /// New mode string.
    Mode(String),
}

impl TelemetrySample {
    /// Merge a partial update into the sample, leaving other fields intact.
    pub fn apply(&mut self, update: TelemetryUpdate) {
        match update {
            TelemetryUpdate::Speed(speed) => self.speed = speed,
            TelemetryUpdate::Status(state) => self.state = state,
            TelemetryUpdate::Current(current) => self.current = Some(current),
            TelemetryUpdate::Voltage(voltage) => self.voltage = Some(voltage),
            TelemetryUpdate::Mode(mode) => self.mode = Some(mode),
        }
    }

    /// Whether the last reported state means the motor is turning.
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running") || self.speed > 0
    }
}

// ============================================================================
// Callback slots
// ============================================================================

type Slot<T> = Mutex<Option<Arc<T>>>;

/// Single-subscriber callback slots shared by a transport and its
/// background tasks.
///
/// Each `set_*` call replaces the previous callback for that metric. The
/// callback is cloned out of its slot before it is invoked, so a callback
/// may safely re-register itself.
#[derive(Default)]
pub struct TelemetryCallbacks {
    speed: Slot<dyn Fn(i32) + Send + Sync>,
    status: Slot<dyn Fn(&str) + Send + Sync>,
    current: Slot<dyn Fn(f32) + Send + Sync>,
    voltage: Slot<dyn Fn(f32) + Send + Sync>,
    mode: Slot<dyn Fn(&str) + Send + Sync>,
    raw: Slot<dyn Fn(&[u8]) + Send + Sync>,
}

impl core::fmt::Debug for TelemetryCallbacks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TelemetryCallbacks")
            .field("speed", &self.speed.lock().is_some())
            .field("status", &self.status.lock().is_some())
            .field("current", &self.current.lock().is_some())
            .field("voltage", &self.voltage.lock().is_some())
            .field("mode", &self.mode.lock().is_some())
            .field("raw", &self.raw.lock().is_some())
            .finish()
    }
}

impl TelemetryCallbacks {
    /// Create empty slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the speed callback.
    pub fn set_speed(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        *self.speed.lock() = Some(Arc::new(callback));
    }

    /// Replace the status callback.
    pub fn set_status(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.status.lock() = Some(Arc::new(callback));
    }

    /// Replace the current callback.
    pub fn set_current(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        *self.current.lock() = Some(Arc::new(callback));
    }

    /// Replace the voltage callback.
    pub fn set_voltage(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        *self.voltage.lock() = Some(Arc::new(callback));
    }

    /// Replace the mode callback.
    pub fn set_mode(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.mode.lock() = Some(Arc::new(callback));
    }

    /// Replace the raw-data callback.
    pub fn set_raw(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.raw.lock() = Some(Arc::new(callback));
    }

    /// Fire the speed callback, if any.
    pub fn emit_speed(&self, speed: i32) {
        let callback = self.speed.lock().clone();
        if let Some(callback) = callback {
            callback(speed);
        }
    }

    /// Fire the status callback, if any.
    pub fn emit_status(&self, status: &str) {
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    /// Fire the current callback, if any.
    pub fn emit_current(&self, current: f32) {
        let callback = self.current.lock().clone();
        if let Some(callback) = callback {
            callback(current);
        }
    }

    /// Fire the voltage callback, if any.
    pub fn emit_voltage(&self, voltage: f32) {
        let callback = self.voltage.lock().clone();
        if let Some(callback) = callback {
            callback(voltage);
        }
    }

    /// Fire the mode callback, if any.
    pub fn emit_mode(&self, mode: &str) {
        let callback = self.mode.lock().clone();
        if let Some(callback) = callback {
            callback(mode);
        }
    }

    /// Fire the raw-data callback, if any.
    pub fn emit_raw(&self, data: &[u8]) {
        let callback = self.raw.lock().clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Merges transport telemetry into a replay-latest [`TelemetrySample`].
///
/// Binding registers the monitor as the transport's single subscriber for
/// every metric, replacing whatever was registered before.
#[derive(Clone, Debug)]
pub struct TelemetryMonitor {
    sample: Arc<watch::Sender<TelemetrySample>>,
}

impl Default for TelemetryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryMonitor {
    /// Create a monitor holding a default sample.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TelemetrySample::default());
        Self {
            sample: Arc::new(tx),
        }
    }

    /// Register this monitor's callbacks on a transport.
    pub fn bind<T: MotorController>(&self, transport: &T) {
        let tx = Arc::clone(&self.sample);
        transport.on_speed(move |v| tx.send_modify(|s| s.apply(TelemetryUpdate::Speed(v))));
        let tx = Arc::clone(&self.sample);
        transport.on_status(move |v| {
            tx.send_modify(|s| s.apply(TelemetryUpdate::Status(v.to_string())))
        });
        let tx = Arc::clone(&self.sample);
        transport.on_current(move |v| tx.send_modify(|s| s.apply(TelemetryUpdate::Current(v))));
        let tx = Arc::clone(&self.sample);
        transport.on_voltage(move |v| tx.send_modify(|s| s.apply(TelemetryUpdate::Voltage(v))));
        let tx = Arc::clone(&self.sample);
        transport.on_mode(move |v| tx.send_modify(|s| s.apply(TelemetryUpdate::Mode(v.to_string()))));
    }

    /// Apply an update directly.
    pub fn apply(&self, update: TelemetryUpdate) {
        self.sample.send_modify(|s| s.apply(update));
    }

    /// Current merged sample.
    pub fn latest(&self) -> TelemetrySample {
        self.sample.borrow().clone()
    }

    /// Subscribe to sample changes (the current value is seen immediately).
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySample> {
        self.sample.subscribe()
    }

    /// Forget all values, e.g. after switching transports.
    pub fn reset(&self) {
        self.sample.send_replace(TelemetrySample::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn sample_merges_partial_updates() {
        let mut sample = TelemetrySample::default();
        sample.apply(TelemetryUpdate::Voltage(230.0));
        sample.apply(TelemetryUpdate::Speed(80));
        sample.apply(TelemetryUpdate::Status("running".into()));

        assert_eq!(sample.speed, 80);
        assert_eq!(sample.state, "running");
        assert_eq!(sample.voltage, Some(230.0));
        assert_eq!(sample.current, None);
        assert!(sample.is_running());
    }

    #[test]
    fn last_registration_wins() {
        let callbacks = TelemetryCallbacks::new();
        let first = Arc::new(AtomicI32::new(-1));
        let second = Arc::new(AtomicI32::new(-1));

        let f = Arc::clone(&first);
        callbacks.set_speed(move |v| f.store(v, Ordering::SeqCst));
        let s = Arc::clone(&second);
        callbacks.set_speed(move |v| s.store(v, Ordering::SeqCst));

        callbacks.emit_speed(42);
        assert_eq!(first.load(Ordering::SeqCst), -1);
        assert_eq!(second.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn emit_without_callback_is_noop() {
        let callbacks = TelemetryCallbacks::new();
        callbacks.emit_speed(1);
        callbacks.emit_status("running");
        callbacks.emit_current(1.0);
        callbacks.emit_voltage(1.0);
        callbacks.emit_mode("auto");
        callbacks.emit_raw(b"x");
    }

    #[test]
    fn callback_can_reregister_itself() {
        let callbacks = Arc::new(TelemetryCallbacks::new());
        let hits = Arc::new(AtomicI32::new(0));

        let cbs = Arc::clone(&callbacks);
        let h = Arc::clone(&hits);
        callbacks.set_speed(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            let h2 = Arc::clone(&h);
            cbs.set_speed(move |_| {
                h2.fetch_add(10, Ordering::SeqCst);
            });
        });

        callbacks.emit_speed(1);
        callbacks.emit_speed(1);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn monitor_reset() {
        let monitor = TelemetryMonitor::new();
        monitor.apply(TelemetryUpdate::Speed(10));
        assert_eq!(monitor.latest().speed, 10);
        monitor.reset();
        assert_eq!(monitor.latest(), TelemetrySample::default());
    }

    #[tokio::test]
    async fn monitor_subscribers_see_latest() {
        let monitor = TelemetryMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.apply(TelemetryUpdate::Mode("auto".into()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().mode.as_deref(), Some("auto"));
    }
}
