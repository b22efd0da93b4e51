//! Provisioning states.
//!
//! Two views of the same flow:
//!
//! - [`Esp32State`] is the coarse device-centric state every caller can watch.
//! - [`SetupStep`] is the finer step of the guided setup screen.
//!
//! ```text
//! Esp32State:
//!   Disconnected -> Searching -> ConfigMode -> Configuring
//!                -> WaitingRestart -> Discovering -> Connected
//!   (any) -> Error;  Error | Connected -> Disconnected via reset
//!
//! SetupStep:
//!   Scanning -> NetworkSelection -> PasswordInput -> Esp32Connection
//!            -> WifiConfig -> WaitingConnection -> NetworkDiscovery -> Completed
//!   (any) -> Error
//! ```

use serde::{Deserialize, Serialize};

use crate::traits::WifiNetwork;

/// Device-centric provisioning state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Esp32State {
    /// No device in reach, or reset.
    #[default]
    Disconnected,
    /// Looking for a stored device or the AP-mode address.
    Searching,
    /// The device answered on its AP-mode address.
    ConfigMode,
    /// Credentials are being pushed.
    Configuring,
    /// Waiting for the device to reboot onto the target network.
    WaitingRestart,
    /// Looking for the device on the target network.
    Discovering,
    /// The device answers on its operational address.
    Connected,
    /// The last operation failed.
    Error(String),
}

impl Esp32State {
    /// Short label for logs and status lines.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Searching => "searching",
            Self::ConfigMode => "config mode",
            Self::Configuring => "configuring",
            Self::WaitingRestart => "waiting for restart",
            Self::Discovering => "discovering",
            Self::Connected => "connected",
            Self::Error(_) => "error",
        }
    }

    /// Whether a timeout-bounded operation is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Searching | Self::Configuring | Self::WaitingRestart | Self::Discovering
        )
    }
}

/// Step of the guided setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupStep {
    /// Scanning for networks.
    #[default]
    Scanning,
    /// Choosing the target network.
    NetworkSelection,
    /// Entering the target network's password.
    PasswordInput,
    /// Checking the device's AP-mode address.
    Esp32Connection,
    /// Pushing credentials.
    WifiConfig,
    /// Waiting for the reboot.
    WaitingConnection,
    /// Looking for the device on the target network.
    NetworkDiscovery,
    /// Done.
    Completed,
    /// Failed; see the session's error.
    Error,
}

impl SetupStep {
    /// Where `go_back` leads. `None` means start over.
    ///
    /// Steps the host runs on its own fall back to the password step, the
    /// last one that took user input.
    pub fn previous(self) -> Option<SetupStep> {
        match self {
            Self::Scanning | Self::NetworkSelection | Self::Completed | Self::Error => None,
            Self::PasswordInput => Some(Self::NetworkSelection),
            Self::Esp32Connection
            | Self::WifiConfig
            | Self::WaitingConnection
            | Self::NetworkDiscovery => Some(Self::PasswordInput),
        }
    }

    /// Progress fraction shown for this step.
    pub fn progress(self) -> Option<f32> {
        match self {
            Self::Scanning => Some(0.0),
            Self::NetworkSelection => Some(0.1),
            Self::PasswordInput => Some(0.2),
            Self::Esp32Connection => Some(0.35),
            Self::WifiConfig => Some(0.5),
            Self::WaitingConnection => Some(0.7),
            Self::NetworkDiscovery => Some(0.85),
            Self::Completed => Some(1.0),
            Self::Error => None,
        }
    }
}

/// Failure shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupFailure {
    /// What went wrong.
    pub message: String,
    /// What to try next.
    pub suggestion: Option<String>,
}

/// State of one guided setup run.
///
/// The candidate password is not part of it; the provisioner keeps that in
/// a zeroizing buffer of its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisioningSession {
    /// Current step.
    pub step: SetupStep,
    /// Progress fraction in `[0, 1]`. Kept at its last value on error.
    pub progress: f32,
    /// Networks offered for selection, strongest first.
    pub networks: Vec<WifiNetwork>,
    /// Target network.
    pub selected_network: Option<WifiNetwork>,
    /// Operational address once the device was found.
    pub device_ip: Option<String>,
    /// Last failure.
    pub last_error: Option<SetupFailure>,
    /// Non-error message, e.g. "configured but not found yet".
    pub notice: Option<String>,
}

impl ProvisioningSession {
    /// Move to `step`, updating progress.
    pub fn advance(&mut self, step: SetupStep) {
        self.step = step;
        if let Some(progress) = step.progress() {
            self.progress = progress;
        }
        if step != SetupStep::Error {
            self.last_error = None;
        }
    }

    /// Move to the error step.
    pub fn fail(&mut self, failure: SetupFailure) {
        self.step = SetupStep::Error;
        self.last_error = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_navigation() {
        assert_eq!(SetupStep::PasswordInput.previous(), Some(SetupStep::NetworkSelection));
        assert_eq!(SetupStep::WifiConfig.previous(), Some(SetupStep::PasswordInput));
        assert_eq!(SetupStep::NetworkDiscovery.previous(), Some(SetupStep::PasswordInput));
        assert_eq!(SetupStep::NetworkSelection.previous(), None);
        assert_eq!(SetupStep::Error.previous(), None);
    }

    #[test]
    fn progress_is_monotonic_along_the_happy_path() {
        let path = [
            SetupStep::Scanning,
            SetupStep::NetworkSelection,
            SetupStep::PasswordInput,
            SetupStep::Esp32Connection,
            SetupStep::WifiConfig,
            SetupStep::WaitingConnection,
            SetupStep::NetworkDiscovery,
            SetupStep::Completed,
        ];
        let values: Vec<f32> = path.iter().filter_map(|s| s.progress()).collect();
        assert_eq!(values.len(), path.len());
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn error_keeps_progress() {
        let mut session = ProvisioningSession::default();
        session.advance(SetupStep::WifiConfig);
        session.fail(SetupFailure {
            message: "device did not answer in time".into(),
            suggestion: None,
        });
        assert_eq!(session.step, SetupStep::Error);
        assert_eq!(session.progress, 0.5);

        session.advance(SetupStep::PasswordInput);
        assert!(session.last_error.is_none());
    }

    #[test]
    fn busy_states() {
        assert!(Esp32State::Configuring.is_busy());
        assert!(!Esp32State::Connected.is_busy());
        assert!(!Esp32State::Error("x".into()).is_busy());
    }
}
