//! Classic Bluetooth platform primitive.
//!
//! [`SppAdapter`] is the raw radio the Bluetooth transport drives: it starts
//! and stops inquiry, and opens RFCOMM streams to the serial port profile.
//! Everything above it (retry policy, read loop, dedup) lives in
//! [`crate::transport::bluetooth`].

use core::fmt;
use core::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::controller::TransportError;

/// Standard serial port profile service class UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

/// A device seen during inquiry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BluetoothDevice {
    /// Friendly name, when the remote side advertised one.
    pub name: Option<String>,
    /// Hardware address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
}

impl BluetoothDevice {
    /// Create a device record.
    pub fn new(name: Option<&str>, address: impl Into<String>) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.into(),
        }
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for BluetoothDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.address)
    }
}

/// Inquiry events reported by the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device answered. The adapter may report the same device repeatedly.
    DeviceFound(BluetoothDevice),
    /// Inquiry ended on its own.
    Finished,
}

/// Platform Bluetooth adapter.
///
/// Implementations convert platform failures into [`TransportError`].
pub trait SppAdapter: Send + Sync + 'static {
    /// Byte stream of one RFCOMM connection.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Start inquiry. Events arrive on the returned channel until
    /// [`DiscoveryEvent::Finished`] or [`SppAdapter::stop_discovery`].
    fn start_discovery(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<DiscoveryEvent>, TransportError>> + Send;

    /// Stop inquiry and release its listeners.
    fn stop_discovery(&self) -> impl Future<Output = ()> + Send;

    /// Open an RFCOMM stream to `address` for `service`.
    fn open_rfcomm(
        &self,
        address: &str,
        service: Uuid,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spp_uuid_is_the_standard_one() {
        assert_eq!(
            SPP_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn device_display_falls_back_to_address() {
        let named = BluetoothDevice::new(Some("SoftStarter"), "00:11:22:33:44:55");
        let bare = BluetoothDevice::new(None, "00:11:22:33:44:55");
        assert_eq!(named.to_string(), "SoftStarter (00:11:22:33:44:55)");
        assert_eq!(bare.display_name(), "00:11:22:33:44:55");
    }
}
