//! ESP32 WiFi provisioning.
//!
//! - [`state`]: device states, guided-setup steps and the session
//! - [`error`]: failures with user-facing messages and suggestions
//! - [`discovery`]: finding the device on a network, scan handling, registry
//! - [`provisioner`]: the state machine tying it together

pub mod discovery;
pub mod error;
pub mod provisioner;
pub mod state;

pub use discovery::{DeviceRegistry, DiscoveredDevice, ScanResult};
pub use error::ProvisioningError;
pub use provisioner::{AutoSetupOutcome, ConfigureOutcome, Esp32Provisioner};
pub use state::{Esp32State, ProvisioningSession, SetupFailure, SetupStep};
