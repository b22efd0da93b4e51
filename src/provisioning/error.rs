//! Provisioning errors.
//!
//! Every variant renders a distinct, human-readable message and most carry
//! a suggested next action.

use core::fmt;
use std::time::Duration;

use crate::store::StoreError;
use crate::traits::{CredentialError, DeviceHttpError, WifiError};

/// A provisioning operation failed.
#[derive(Debug)]
pub enum ProvisioningError {
    /// Nothing answered at a specific address.
    DeviceUnreachable {
        /// Address probed.
        ip: String,
    },
    /// The AP-mode address did not answer.
    NotInConfigMode {
        /// AP-mode address probed.
        ap_ip: String,
    },
    /// The host is not joined to any WiFi network.
    NoWifiNetwork,
    /// The stored device was provisioned on another network.
    WrongNetwork {
        /// SSID at configuration time.
        expected: String,
        /// SSID the host is on now.
        actual: Option<String>,
    },
    /// No device has been configured yet.
    NotConfigured,
    /// The device could not be found on the target network.
    NotFound,
    /// A bounded stage ran out of time.
    Timeout {
        /// Which stage.
        stage: &'static str,
        /// The bound that expired.
        after: Duration,
    },
    /// Bad user input.
    InvalidInput(String),
    /// The device refused the credentials.
    Rejected(String),
    /// Device HTTP failure.
    Http(DeviceHttpError),
    /// Host WiFi scan failed.
    Scan(WifiError),
    /// Persisting the result failed.
    Store(StoreError),
    /// The operation was cancelled.
    Cancelled,
}

impl ProvisioningError {
    /// What the user could try next.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::DeviceUnreachable { .. } => {
                Some("Check the address and that the device is powered on")
            }
            Self::NotInConfigMode { .. } => Some(
                "Hold the device's setup button until its access point appears, then join it",
            ),
            Self::NoWifiNetwork => Some("Join the WiFi network the device should use"),
            Self::WrongNetwork { .. } => {
                Some("Switch back to the configured network or set the device up again")
            }
            Self::NotConfigured => Some("Run the device setup first"),
            Self::NotFound => {
                Some("Wait a moment and retry discovery, or enter the device's IP address")
            }
            Self::Timeout { stage: "rediscovery", .. } => {
                Some("The device may still be joining; retry discovery shortly")
            }
            Self::Timeout { .. } => Some("Move closer to the device and try again"),
            Self::InvalidInput(_) => None,
            Self::Rejected(_) => Some("Check the network name and password"),
            Self::Http(_) => Some("Make sure the device is reachable and try again"),
            Self::Scan(_) => Some("Make sure WiFi is enabled on this computer"),
            Self::Store(_) => None,
            Self::Cancelled => None,
        }
    }
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUnreachable { ip } => write!(f, "device unreachable at {}", ip),
            Self::NotInConfigMode { ap_ip } => {
                write!(f, "device not in configuration mode (no answer at {})", ap_ip)
            }
            Self::NoWifiNetwork => write!(f, "not connected to a WiFi network"),
            Self::WrongNetwork { expected, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "wrong network: device was set up on {:?}, now on {:?}",
                    expected, actual
                ),
                None => write!(f, "wrong network: device was set up on {:?}", expected),
            },
            Self::NotConfigured => write!(f, "no device configured"),
            Self::NotFound => write!(f, "device not found on the network"),
            Self::Timeout { stage, after } => {
                write!(f, "timeout: {} took longer than {}s", stage, after.as_secs())
            }
            Self::InvalidInput(e) => write!(f, "invalid input: {}", e),
            Self::Rejected(e) => write!(f, "device rejected the configuration: {}", e),
            Self::Http(e) => write!(f, "{}", e),
            Self::Scan(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "{}", e),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ProvisioningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            Self::Scan(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceHttpError> for ProvisioningError {
    fn from(e: DeviceHttpError) -> Self {
        Self::Http(e)
    }
}

impl From<WifiError> for ProvisioningError {
    fn from(e: WifiError) -> Self {
        Self::Scan(e)
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<CredentialError> for ProvisioningError {
    fn from(e: CredentialError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages_are_distinct() {
        let errors = [
            ProvisioningError::DeviceUnreachable { ip: "10.0.0.2".into() },
            ProvisioningError::WrongNetwork {
                expected: "Home".into(),
                actual: Some("Cafe".into()),
            },
            ProvisioningError::Timeout {
                stage: "configure",
                after: Duration::from_secs(15),
            },
            ProvisioningError::InvalidInput("bad ip".into()),
        ];
        let prefixes: Vec<String> = errors
            .iter()
            .map(|e| e.to_string().split(':').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            prefixes,
            vec![
                "device unreachable at 10.0.0.2",
                "wrong network",
                "timeout",
                "invalid input"
            ]
        );
    }

    #[test]
    fn suggestions() {
        assert!(ProvisioningError::NotInConfigMode { ap_ip: "192.168.4.1".into() }
            .suggestion()
            .is_some());
        assert!(ProvisioningError::Cancelled.suggestion().is_none());
        let rediscovery = ProvisioningError::Timeout {
            stage: "rediscovery",
            after: Duration::from_secs(10),
        };
        assert!(rediscovery.suggestion().unwrap_or_default().contains("retry"));
    }
}
