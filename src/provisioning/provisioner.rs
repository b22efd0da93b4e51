//! The ESP32 provisioning state machine.
//!
//! [`Esp32Provisioner`] walks a device from AP mode onto the user's network:
//!
//! 1. [`auto_setup`](Esp32Provisioner::auto_setup) short-circuits to
//!    `Connected` if the stored device still answers, otherwise checks that
//!    the AP-mode address answers and the host is on a WiFi network.
//! 2. [`configure_wifi`](Esp32Provisioner::configure_wifi) pushes the
//!    credentials, waits out the reboot, then rediscovers the device.
//! 3. Once connected, a background task pings the device periodically.
//!
//! Every timeout-bounded operation runs under a cancellation token.
//! Cancelling stops it at its next suspension point and leaves nothing
//! persisted; the result is only written to the store once the device has
//! been found on its new address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::config::ProvisioningConfig;
use crate::store::{NetworkConfig, NetworkConfigStore};
use crate::traits::{
    DeviceHttp, DeviceStatus, FallbackDiscovery, NoFallback, WifiCredentials, WifiInfo,
    WifiNetwork,
};

use super::discovery::{
    prepare_scan, rediscover, sweep_subnet, DeviceRegistry, DiscoveredDevice,
};
use super::error::ProvisioningError;
use super::state::{Esp32State, ProvisioningSession, SetupFailure, SetupStep};

/// Result of [`Esp32Provisioner::auto_setup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutoSetupOutcome {
    /// The stored device answered; nothing to configure.
    AlreadyConfigured {
        /// Its address.
        ip: String,
    },
    /// The device is in AP mode and the host is on `ssid`; credentials are
    /// needed to continue.
    NeedsPassword {
        /// Host's current network.
        ssid: String,
    },
}

/// Result of a credential push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// The device was found on the target network and saved.
    Configured {
        /// Its new address.
        ip: String,
    },
    /// The device accepted the credentials but was not found in time.
    ConfiguredNotFound {
        /// Advice for the user.
        notice: String,
    },
}

const NOT_FOUND_NOTICE: &str =
    "The device accepted the WiFi settings but has not appeared on the network yet. \
     Wait a moment, then retry discovery or enter its IP address.";

struct Poller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives provisioning against a device API, the host WiFi and a store.
pub struct Esp32Provisioner<H: DeviceHttp, W: WifiInfo, F: FallbackDiscovery = NoFallback> {
    http: Arc<H>,
    wifi: Arc<W>,
    fallback: Arc<F>,
    store: Arc<NetworkConfigStore>,
    config: ProvisioningConfig,
    state: Arc<watch::Sender<Esp32State>>,
    session: watch::Sender<ProvisioningSession>,
    last_seen: Arc<watch::Sender<Option<DateTime<Utc>>>>,
    password: Mutex<Option<Zeroizing<String>>>,
    registry: DeviceRegistry,
    operation: Mutex<CancellationToken>,
    poller: Mutex<Option<Poller>>,
}

impl<H: DeviceHttp, W: WifiInfo> Esp32Provisioner<H, W, NoFallback> {
    /// Provisioner without a fallback discovery.
    pub fn new(
        http: Arc<H>,
        wifi: Arc<W>,
        store: Arc<NetworkConfigStore>,
        config: ProvisioningConfig,
    ) -> Self {
        Self::with_fallback(http, wifi, Arc::new(NoFallback), store, config)
    }
}

impl<H: DeviceHttp, W: WifiInfo, F: FallbackDiscovery> Drop for Esp32Provisioner<H, W, F> {
    fn drop(&mut self) {
        self.operation.lock().cancel();
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.task.abort();
        }
    }
}

impl<H: DeviceHttp, W: WifiInfo, F: FallbackDiscovery> Esp32Provisioner<H, W, F> {
    /// Provisioner with a fallback discovery.
    pub fn with_fallback(
        http: Arc<H>,
        wifi: Arc<W>,
        fallback: Arc<F>,
        store: Arc<NetworkConfigStore>,
        config: ProvisioningConfig,
    ) -> Self {
        let (state, _) = watch::channel(Esp32State::Disconnected);
        let (session, _) = watch::channel(ProvisioningSession::default());
        let (last_seen, _) = watch::channel(None);
        Self {
            http,
            wifi,
            fallback,
            store,
            config,
            state: Arc::new(state),
            session,
            last_seen: Arc::new(last_seen),
            password: Mutex::new(None),
            registry: DeviceRegistry::new(),
            operation: Mutex::new(CancellationToken::new()),
            poller: Mutex::new(None),
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Current device state.
    pub fn state(&self) -> Esp32State {
        self.state.borrow().clone()
    }

    /// Watch the device state.
    pub fn subscribe_state(&self) -> watch::Receiver<Esp32State> {
        self.state.subscribe()
    }

    /// Current guided-setup session.
    pub fn session(&self) -> ProvisioningSession {
        self.session.borrow().clone()
    }

    /// Watch the guided-setup session.
    pub fn subscribe_session(&self) -> watch::Receiver<ProvisioningSession> {
        self.session.subscribe()
    }

    /// When the device last answered a liveness poll.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.borrow()
    }

    /// Devices seen so far.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The configuration store.
    pub fn store(&self) -> &NetworkConfigStore {
        &self.store
    }

    /// Whether a guided-setup password is waiting to be used.
    pub fn has_candidate_password(&self) -> bool {
        self.password.lock().is_some()
    }

    /// Whether a liveness poller is running.
    pub fn is_polling(&self) -> bool {
        self.poller.lock().is_some()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn set_state(&self, state: Esp32State) {
        debug!("provisioning state: {}", state.as_str());
        self.state.send_replace(state);
    }

    fn advance(&self, step: SetupStep) {
        self.session.send_modify(|s| s.advance(step));
    }

    /// Start an operation, cancelling any still in flight.
    ///
    /// Also stops liveness polling; a device found by the new operation
    /// gets its own poller.
    fn begin_operation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.operation.lock(), token.clone());
        previous.cancel();
        self.stop_polling();
        token
    }

    async fn cancellable<T>(
        token: &CancellationToken,
        work: impl std::future::Future<Output = Result<T, ProvisioningError>>,
    ) -> Result<T, ProvisioningError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProvisioningError::Cancelled),
            result = work => result,
        }
    }

    /// Record a failure in both views. Cancellation is not a failure.
    fn fail(&self, error: ProvisioningError) -> ProvisioningError {
        if matches!(error, ProvisioningError::Cancelled) {
            return error;
        }
        warn!("provisioning failed: {}", error);
        self.set_state(Esp32State::Error(error.to_string()));
        let failure = SetupFailure {
            message: error.to_string(),
            suggestion: error.suggestion().map(str::to_string),
        };
        self.session.send_modify(|s| s.fail(failure));
        error
    }

    async fn host_ssid(&self) -> Option<String> {
        self.wifi.current_ssid().await
    }

    fn device_name(&self) -> String {
        self.registry
            .devices()
            .into_iter()
            .map(|d| d.device_name)
            .find(|name| name.starts_with(&self.config.device_ap_prefix))
            .unwrap_or_else(|| self.config.device_ap_prefix.clone())
    }

    /// Persist a found device, go `Connected` and start polling.
    fn adopt(&self, ip: &str, ssid: Option<&str>) -> Result<NetworkConfig, ProvisioningError> {
        let saved = self.store.save_device(ip, None, ssid)?;
        let name = self.device_name();
        self.registry.record(DiscoveredDevice {
            ap_ssid: name.clone(),
            device_name: name,
            ap_ip: self.config.ap_ip.clone(),
            wifi_ip: Some(ip.to_string()),
            wifi_ssid: ssid.map(str::to_string),
        });
        self.session.send_modify(|s| {
            s.device_ip = Some(ip.to_string());
            s.notice = None;
            s.advance(SetupStep::Completed);
        });
        self.set_state(Esp32State::Connected);
        self.start_polling(ip);
        info!("device provisioned at {}", ip);
        Ok(saved)
    }

    // ========================================================================
    // Liveness polling
    // ========================================================================

    fn start_polling(&self, ip: &str) {
        self.stop_polling();
        self.last_seen.send_replace(Some(Utc::now()));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_liveness(
            Arc::clone(&self.http),
            ip.to_string(),
            self.config.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.last_seen),
            cancel.clone(),
        ));
        *self.poller.lock() = Some(Poller { cancel, task });
    }

    fn stop_polling(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.task.abort();
            debug!("liveness polling stopped");
        }
    }

    // ========================================================================
    // Automatic flow
    // ========================================================================

    /// Check for a working stored device, then for a device in AP mode.
    pub async fn auto_setup(&self) -> Result<AutoSetupOutcome, ProvisioningError> {
        let token = self.begin_operation();
        let result = Self::cancellable(&token, self.auto_setup_inner()).await;
        result.map_err(|e| self.fail(e))
    }

    async fn auto_setup_inner(&self) -> Result<AutoSetupOutcome, ProvisioningError> {
        self.set_state(Esp32State::Searching);

        let stored = self.store.snapshot();
        if stored.is_configured && !stored.esp32_ip.trim().is_empty() {
            if self.http.ping(&stored.esp32_ip, self.config.ping_timeout()).await {
                info!("stored device answers at {}", stored.esp32_ip);
                self.session.send_modify(|s| {
                    s.device_ip = Some(stored.esp32_ip.clone());
                    s.advance(SetupStep::Completed);
                });
                self.set_state(Esp32State::Connected);
                self.start_polling(&stored.esp32_ip);
                return Ok(AutoSetupOutcome::AlreadyConfigured {
                    ip: stored.esp32_ip,
                });
            }
            debug!("stored device at {} did not answer", stored.esp32_ip);
        }

        let ap_ip = self.config.ap_ip.clone();
        if !self.http.ping(&ap_ip, self.config.ap_probe_timeout()).await {
            return Err(ProvisioningError::NotInConfigMode { ap_ip });
        }
        self.set_state(Esp32State::ConfigMode);

        let ssid = self
            .host_ssid()
            .await
            .ok_or(ProvisioningError::NoWifiNetwork)?;
        info!("device in config mode, host on {:?}", ssid);
        Ok(AutoSetupOutcome::NeedsPassword { ssid })
    }

    /// Push credentials, wait for the reboot and find the device again.
    ///
    /// Not finding the device in time is a partial success, reported as
    /// [`ConfigureOutcome::ConfiguredNotFound`] with the state back at
    /// `Disconnected`.
    pub async fn configure_wifi(
        &self,
        ssid: &str,
        password: &str,
    ) -> Result<ConfigureOutcome, ProvisioningError> {
        let token = self.begin_operation();
        let result = Self::cancellable(&token, self.configure_inner(ssid, password)).await;
        result.map_err(|e| self.fail(e))
    }

    async fn configure_inner(
        &self,
        ssid: &str,
        password: &str,
    ) -> Result<ConfigureOutcome, ProvisioningError> {
        let credentials = WifiCredentials::new(ssid, password)?;

        self.set_state(Esp32State::Configuring);
        self.advance(SetupStep::WifiConfig);
        let bound = self.config.configure_timeout();
        let response = tokio::time::timeout(
            bound,
            self.http.configure(&self.config.ap_ip, &credentials, bound),
        )
        .await
        .map_err(|_| ProvisioningError::Timeout {
            stage: "configure",
            after: bound,
        })??;
        if !response.success {
            return Err(ProvisioningError::Rejected(response.message));
        }
        info!("device accepted credentials for {:?}", ssid);

        self.set_state(Esp32State::WaitingRestart);
        self.advance(SetupStep::WaitingConnection);
        tokio::time::sleep(self.config.restart_grace()).await;

        self.set_state(Esp32State::Discovering);
        self.advance(SetupStep::NetworkDiscovery);
        let found = tokio::time::timeout(
            self.config.rediscovery_timeout(),
            rediscover(&*self.http, &*self.fallback, &self.config),
        )
        .await
        .ok()
        .flatten();

        match found {
            Some(ip) => {
                let host_ssid = self.host_ssid().await.unwrap_or_else(|| ssid.to_string());
                self.adopt(&ip, Some(&host_ssid))?;
                Ok(ConfigureOutcome::Configured { ip })
            }
            None => {
                warn!("device not found after reboot");
                self.stop_polling();
                self.set_state(Esp32State::Disconnected);
                self.session.send_modify(|s| {
                    s.advance(SetupStep::NetworkDiscovery);
                    s.notice = Some(NOT_FOUND_NOTICE.to_string());
                });
                Ok(ConfigureOutcome::ConfiguredNotFound {
                    notice: NOT_FOUND_NOTICE.to_string(),
                })
            }
        }
    }

    /// Use `ip` directly, skipping AP mode and rediscovery.
    pub async fn configure_manual_ip(&self, ip: &str) -> Result<NetworkConfig, ProvisioningError> {
        let token = self.begin_operation();
        let result = Self::cancellable(&token, self.manual_ip_inner(ip)).await;
        result.map_err(|e| self.fail(e))
    }

    async fn manual_ip_inner(&self, ip: &str) -> Result<NetworkConfig, ProvisioningError> {
        let ip = ip.trim();
        let parsed: Ipv4Addr = ip
            .parse()
            .map_err(|_| ProvisioningError::InvalidInput(format!("{:?} is not an IPv4 address", ip)))?;
        let ip = parsed.to_string();

        self.set_state(Esp32State::Searching);
        if !self.http.ping(&ip, self.config.ping_timeout()).await {
            return Err(ProvisioningError::DeviceUnreachable { ip });
        }
        let ssid = self.host_ssid().await;
        self.adopt(&ip, ssid.as_deref())
    }

    /// Look for the device again after a "configured but not found" result.
    ///
    /// Tries the priority list and fallback first, then sweeps the host's
    /// /24.
    pub async fn retry_discovery(&self) -> Result<String, ProvisioningError> {
        let token = self.begin_operation();
        let result = Self::cancellable(&token, self.retry_discovery_inner()).await;
        result.map_err(|e| self.fail(e))
    }

    async fn retry_discovery_inner(&self) -> Result<String, ProvisioningError> {
        self.set_state(Esp32State::Discovering);
        self.advance(SetupStep::NetworkDiscovery);

        let mut found = tokio::time::timeout(
            self.config.rediscovery_timeout(),
            rediscover(&*self.http, &*self.fallback, &self.config),
        )
        .await
        .ok()
        .flatten();

        if found.is_none() {
            if let Some(host_ip) = self.wifi.current_ipv4().await {
                found = sweep_subnet(
                    &*self.http,
                    host_ip,
                    &self.config.identity_markers,
                    self.config.probe_timeout(),
                    self.config.sweep_concurrency,
                )
                .await;
            }
        }

        let ip = found.ok_or(ProvisioningError::NotFound)?;
        let ssid = self.host_ssid().await;
        self.adopt(&ip, ssid.as_deref())?;
        Ok(ip)
    }

    // ========================================================================
    // Guided flow
    // ========================================================================

    /// Start a guided setup: scan and offer the visible networks.
    ///
    /// Device access points are recorded in the registry and left out of
    /// the offered list.
    pub async fn begin_setup(&self) -> Result<Vec<WifiNetwork>, ProvisioningError> {
        let token = self.begin_operation();
        self.password.lock().take();
        self.session.send_replace(ProvisioningSession::default());
        let result = Self::cancellable(&token, self.scan_inner()).await;
        result.map_err(|e| self.fail(e))
    }

    async fn scan_inner(&self) -> Result<Vec<WifiNetwork>, ProvisioningError> {
        let scan = prepare_scan(self.wifi.scan().await?, &self.config.device_ap_prefix);
        for ap in &scan.device_aps {
            self.registry.record(DiscoveredDevice {
                device_name: ap.ssid.clone(),
                ap_ip: self.config.ap_ip.clone(),
                ap_ssid: ap.ssid.clone(),
                wifi_ip: None,
                wifi_ssid: None,
            });
        }
        let networks = scan.networks;
        self.session.send_modify(|s| {
            s.networks = networks.clone();
            s.advance(SetupStep::NetworkSelection);
        });
        Ok(networks)
    }

    /// Pick the target network from the offered list.
    pub fn select_network(&self, ssid: &str) -> Result<(), ProvisioningError> {
        let session = self.session();
        if session.step != SetupStep::NetworkSelection {
            return Err(ProvisioningError::InvalidInput(
                "no network list to choose from".to_string(),
            ));
        }
        let network = session
            .networks
            .iter()
            .find(|n| n.ssid == ssid)
            .cloned()
            .ok_or_else(|| ProvisioningError::InvalidInput(format!("unknown network {:?}", ssid)))?;
        self.session.send_modify(|s| {
            s.selected_network = Some(network);
            s.advance(SetupStep::PasswordInput);
        });
        Ok(())
    }

    /// Submit the password for the selected network and run the
    /// configuration.
    pub async fn submit_password(
        &self,
        password: &str,
    ) -> Result<ConfigureOutcome, ProvisioningError> {
        let session = self.session();
        let network = match (session.step, session.selected_network) {
            (SetupStep::PasswordInput, Some(network)) => network,
            _ => {
                return Err(ProvisioningError::InvalidInput(
                    "no network selected".to_string(),
                ))
            }
        };
        if network.is_secured() && password.is_empty() {
            return Err(ProvisioningError::InvalidInput(format!(
                "{:?} needs a password",
                network.ssid
            )));
        }
        let secret = Zeroizing::new(password.to_string());
        *self.password.lock() = Some(secret.clone());

        let token = self.begin_operation();
        let result = Self::cancellable(&token, async {
            self.advance(SetupStep::Esp32Connection);
            let ap_ip = self.config.ap_ip.clone();
            if !self.http.ping(&ap_ip, self.config.ap_probe_timeout()).await {
                return Err(ProvisioningError::NotInConfigMode { ap_ip });
            }
            self.set_state(Esp32State::ConfigMode);
            self.configure_inner(&network.ssid, &secret).await
        })
        .await;
        if result.is_ok() {
            self.password.lock().take();
        }
        result.map_err(|e| self.fail(e))
    }

    /// Step back. From the first step or an error this starts over.
    pub fn go_back(&self) -> SetupStep {
        self.operation.lock().cancel();
        let step = self.session.borrow().step;
        match step.previous() {
            Some(previous) => {
                if self.state().is_busy() {
                    self.set_state(Esp32State::Disconnected);
                }
                self.session.send_modify(|s| {
                    s.notice = None;
                    s.advance(previous);
                });
                previous
            }
            None => {
                self.password.lock().take();
                if matches!(self.state(), Esp32State::Error(_)) || self.state().is_busy() {
                    self.set_state(Esp32State::Disconnected);
                }
                self.session.send_replace(ProvisioningSession::default());
                SetupStep::Scanning
            }
        }
    }

    /// Abandon the operation in flight.
    ///
    /// The state returns to `Disconnected` and the guided flow to the last
    /// step that took input. Nothing is persisted.
    pub fn cancel(&self) {
        self.operation.lock().cancel();
        if self.state().is_busy() {
            self.set_state(Esp32State::Disconnected);
        }
        self.password.lock().take();
        self.session.send_modify(|s| {
            let step = if s.selected_network.is_some() {
                SetupStep::PasswordInput
            } else if !s.networks.is_empty() {
                SetupStep::NetworkSelection
            } else {
                SetupStep::Scanning
            };
            s.notice = None;
            s.advance(step);
        });
        info!("provisioning cancelled");
    }

    /// Drop everything: operation, polling, session and state.
    pub fn reset(&self) {
        self.operation.lock().cancel();
        self.stop_polling();
        self.password.lock().take();
        self.last_seen.send_replace(None);
        self.session.send_replace(ProvisioningSession::default());
        self.set_state(Esp32State::Disconnected);
    }

    // ========================================================================
    // Stored configuration and device calls
    // ========================================================================

    /// The stored configuration, if it is valid on the current network.
    pub async fn check_stored_configuration(&self) -> Result<NetworkConfig, ProvisioningError> {
        let stored = self.store.snapshot();
        if !stored.is_configured || stored.esp32_ip.trim().is_empty() {
            return Err(ProvisioningError::NotConfigured);
        }
        let current = self.host_ssid().await;
        if !stored.is_valid_on(current.as_deref()) {
            return Err(ProvisioningError::WrongNetwork {
                expected: stored.network_ssid,
                actual: current,
            });
        }
        Ok(stored)
    }

    fn device_ip(&self) -> String {
        let stored = self.store.snapshot();
        if stored.is_configured && !stored.esp32_ip.trim().is_empty() {
            stored.esp32_ip
        } else {
            self.config.ap_ip.clone()
        }
    }

    /// `GET /status` from the stored device, or the AP address if none.
    pub async fn device_status(&self) -> Result<DeviceStatus, ProvisioningError> {
        Ok(self.http.status(&self.device_ip()).await?)
    }

    /// `POST /restart` to the stored device, or the AP address if none.
    pub async fn restart_device(&self) -> Result<(), ProvisioningError> {
        let ip = self.device_ip();
        self.http.restart(&ip).await?;
        info!("restart requested for {}", ip);
        Ok(())
    }
}

async fn poll_liveness<H: DeviceHttp>(
    http: Arc<H>,
    ip: String,
    config: ProvisioningConfig,
    state: Arc<watch::Sender<Esp32State>>,
    last_seen: Arc<watch::Sender<Option<DateTime<Utc>>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
        let alive = tokio::select! {
            _ = cancel.cancelled() => break,
            alive = http.ping(&ip, config.ping_timeout()) => alive,
        };
        if alive {
            last_seen.send_replace(Some(Utc::now()));
            state.send_if_modified(|s| {
                if *s == Esp32State::Disconnected {
                    info!("device at {} is back", ip);
                    *s = Esp32State::Connected;
                    true
                } else {
                    false
                }
            });
        } else {
            state.send_if_modified(|s| {
                if *s == Esp32State::Connected {
                    warn!("device at {} stopped answering", ip);
                    *s = Esp32State::Disconnected;
                    true
                } else {
                    false
                }
            });
        }
    }
}
