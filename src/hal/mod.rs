//! Platform implementations of the traits in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: in-memory doubles for tests (requires `mock` feature)
//! - `host`: `nmcli` WiFi state, UDP broadcast discovery, [`NoBluetooth`]
//! - `rumqtt`: MQTT over `rumqttc` (requires `mqtt` feature)
//! - `http`: device and backend HTTP over `reqwest` (requires `http` feature)
//! - `bluez`: RFCOMM over BlueZ (requires `bluez` feature)

pub mod host;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "mqtt")]
pub mod rumqtt;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use host::{NoBluetooth, NmcliWifi, UdpBroadcastDiscovery, DISCOVERY_PORT};

#[cfg(any(test, feature = "mock"))]
pub use mock::*;

#[cfg(feature = "mqtt")]
pub use rumqtt::{RumqttcClient, RumqttcConnector};

#[cfg(feature = "http")]
pub use http::{BackendClient, ReqwestDeviceClient};

#[cfg(feature = "bluez")]
pub use bluez::{BluezAdapter, BluezStream};
