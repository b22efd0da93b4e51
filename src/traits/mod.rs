//! Trait seams between the control layer and the platform.
//!
//! # Submodules
//!
//! - `controller`: the [`MotorController`] contract every transport implements
//! - `bluetooth`: classic Bluetooth adapter primitive ([`SppAdapter`])
//! - `network`: MQTT client/connector and the backend audit channel
//! - `device`: ESP32 HTTP API, host WiFi and broadcast discovery
//!
//! Concrete implementations live in [`crate::hal`]; test doubles in
//! `hal::mock` behind the `mock` feature.

pub mod bluetooth;
pub mod controller;
pub mod device;
pub mod network;

pub use bluetooth::*;
pub use controller::*;
pub use device::*;
pub use network::*;
