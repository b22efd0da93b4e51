//! # rs-softstart
//!
//! Client-side control layer for an ESP32 DC motor soft-starter.
//!
//! ## Features
//!
//! - **Wire protocol**: ASCII soft-start/continuous/stop commands and the
//!   marker-offset Bluetooth speed byte
//! - **One transport contract**: Bluetooth SPP and MQTT behind
//!   [`MotorController`], with single-subscriber telemetry callbacks
//! - **Single active session**: [`TransportManager`] closes one link before
//!   opening the next and mirrors commands to a best-effort audit API
//! - **WiFi provisioning**: push credentials to the device's AP mode, wait
//!   for the reboot and find it again on the user's network
//! - **Network configuration store**: last-known-good device address,
//!   invalidated when the host changes network
//!
//! ## Architecture
//!
//! The crate is structured to allow testing without a radio, broker or device:
//!
//! - `traits` - Transport contract and platform primitives
//! - `protocol` - Command encoding and telemetry decoding
//! - `telemetry` - Callback slots and the merged telemetry sample
//! - `transport` - Bluetooth and MQTT transports, manager
//! - `provisioning` - ESP32 setup state machine
//! - `store` - Persisted network configuration
//! - `hal` - Concrete implementations (mocks, rumqttc, reqwest, BlueZ, nmcli)
//!
//! ## Example
//!
//! With the `mock` feature:
//!
//! ```rust
//! use rs_softstart::{
//!     config::MqttConfig,
//!     hal::{MockMqttConnector, NoBluetooth},
//!     MotorCommand, MqttTransport, TransportManager,
//! };
//!
//! # tokio_test_main();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test_main() {
//! let manager: TransportManager<NoBluetooth, MockMqttConnector> = TransportManager::new();
//! manager
//!     .activate(MqttTransport::new(MockMqttConnector::new(), MqttConfig::default()))
//!     .await
//!     .unwrap();
//!
//! manager.send_soft_start([50, 100, 150, 200, 250, 254]).await.unwrap();
//! assert_eq!(
//!     MotorCommand::soft_start([50, 100, 150, 200, 250, 254]).encode(),
//!     "50a,100b,150c,200d,250e,254f"
//! );
//! # }
//! ```

#![warn(missing_docs)]

/// Application configuration with TOML persistence.
pub mod config;
/// Platform implementations, including mocks for testing.
pub mod hal;
/// Motor command wire protocol.
pub mod protocol;
/// ESP32 WiFi provisioning state machine.
pub mod provisioning;
/// Persisted network configuration.
pub mod store;
/// Telemetry callbacks and aggregation.
pub mod telemetry;
/// Transport contract and platform primitives.
pub mod traits;
/// Bluetooth and MQTT transports and the single-session manager.
pub mod transport;

// Re-exports for convenience
pub use protocol::{
    decode_speed, encode_continuous, encode_soft_start, encode_speed, encode_stop,
    validate_command, MotorCommand,
};
pub use provisioning::{
    AutoSetupOutcome, ConfigureOutcome, Esp32Provisioner, Esp32State, ProvisioningError,
    SetupStep,
};
pub use store::{NetworkConfig, NetworkConfigStore};
pub use telemetry::{TelemetryMonitor, TelemetrySample};
pub use traits::{
    // Bluetooth
    BluetoothDevice,
    // Transport contract
    ConnectionState,
    // Device
    DeviceHttp,
    FallbackDiscovery,
    MotorController,
    // MQTT
    MqttClient,
    MqttConnector,
    SppAdapter,
    TransportError,
    TransportKind,
    WifiInfo,
};
pub use transport::{AnyTransport, BluetoothTransport, MqttTransport, TransportManager};
