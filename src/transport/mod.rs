//! Motor transports and the manager that keeps exactly one of them active.
//!
//! - [`BluetoothTransport`]: SPP over any [`SppAdapter`](crate::traits::SppAdapter)
//! - [`MqttTransport`]: pub/sub over any [`MqttConnector`](crate::traits::MqttConnector)
//! - [`AnyTransport`]: either of the above behind one type
//! - [`TransportManager`]: single active session plus the audit channel

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::traits::ConnectionState;

pub mod any;
pub mod bluetooth;
pub mod manager;
pub mod mqtt;

pub use any::AnyTransport;
pub use bluetooth::{BluetoothDiscovery, BluetoothTransport};
pub use manager::TransportManager;
pub use mqtt::{device_topic, dispatch_message, MqttTransport, TELEMETRY_LEAVES};

/// Holds a transport's `connecting` flag for the length of one connect.
///
/// Dropping the guard releases the flag even when the connect future is
/// dropped mid-await. An abandoned attempt that left the state at
/// `Connecting` falls back to `Disconnected`.
pub(crate) struct ConnectGuard<'a> {
    flag: &'a AtomicBool,
    state: &'a watch::Sender<ConnectionState>,
}

impl<'a> ConnectGuard<'a> {
    /// Take the flag, or `None` if a connect is already running.
    pub(crate) fn acquire(
        flag: &'a AtomicBool,
        state: &'a watch::Sender<ConnectionState>,
    ) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self { flag, state })
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        self.flag.store(false, Ordering::SeqCst);
    }
}
