//! Finding the ESP32 on a network.
//!
//! Rediscovery after a reboot runs in two phases:
//!
//! 1. The priority list (common router DHCP addresses) is probed in order
//!    with a few requests in flight; the first address that answers *and*
//!    identifies as the device wins.
//! 2. Otherwise the [`FallbackDiscovery`] is asked. Its answer is only
//!    trusted after a liveness check of its own.
//!
//! A full /24 sweep is available for manual retries; it is too slow for
//! the bounded post-reboot window.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::ProvisioningConfig;
use crate::traits::{DeviceHttp, FallbackDiscovery, WifiNetwork};

/// Requests in flight while walking the priority list.
const PRIORITY_CONCURRENCY: usize = 4;

// ============================================================================
// Probing
// ============================================================================

/// Whether `ip` answers and identifies as the device.
pub async fn is_device_at<H: DeviceHttp>(
    http: &H,
    ip: &str,
    markers: &[String],
    timeout: Duration,
) -> bool {
    match http.probe(ip, timeout).await {
        Some(reply) => {
            let matched = reply.mentions_any(markers);
            if !matched {
                debug!("{} answered but is not the device", ip);
            }
            matched
        }
        None => false,
    }
}

/// First address of `ips`, in list order, that identifies as the device.
pub async fn probe_priority_list<H: DeviceHttp>(
    http: &H,
    ips: &[String],
    markers: &[String],
    timeout: Duration,
) -> Option<String> {
    let mut probes = stream::iter(ips.iter().cloned())
        .map(|ip| async move { is_device_at(http, &ip, markers, timeout).await.then_some(ip) })
        .buffered(PRIORITY_CONCURRENCY);
    while let Some(result) = probes.next().await {
        if let Some(ip) = result {
            return Some(ip);
        }
    }
    None
}

/// Priority list, then the fallback.
pub async fn rediscover<H: DeviceHttp, F: FallbackDiscovery>(
    http: &H,
    fallback: &F,
    config: &ProvisioningConfig,
) -> Option<String> {
    if let Some(ip) = probe_priority_list(
        http,
        &config.priority_ips,
        &config.identity_markers,
        config.probe_timeout(),
    )
    .await
    {
        info!("device found at priority address {}", ip);
        return Some(ip);
    }

    let candidate = fallback.discover(config.probe_timeout()).await?;
    if http.ping(&candidate, config.ping_timeout()).await {
        info!("device found by fallback discovery at {}", candidate);
        Some(candidate)
    } else {
        debug!("fallback answer {} did not respond to ping", candidate);
        None
    }
}

/// Probe every host of `host_ip`'s /24 except `host_ip` itself.
pub async fn sweep_subnet<H: DeviceHttp>(
    http: &H,
    host_ip: Ipv4Addr,
    markers: &[String],
    timeout: Duration,
    concurrency: usize,
) -> Option<String> {
    let [a, b, c, own] = host_ip.octets();
    let candidates: Vec<String> = (1..=254u8)
        .filter(|&d| d != own)
        .map(|d| Ipv4Addr::new(a, b, c, d).to_string())
        .collect();
    debug!("sweeping {}.{}.{}.0/24", a, b, c);

    let mut probes = stream::iter(candidates)
        .map(|ip| async move { is_device_at(http, &ip, markers, timeout).await.then_some(ip) })
        .buffer_unordered(concurrency.max(1));
    while let Some(result) = probes.next().await {
        if let Some(ip) = result {
            return Some(ip);
        }
    }
    None
}

// ============================================================================
// Scan results
// ============================================================================

/// A WiFi scan split into target networks and device access points.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Networks the device could join, strongest first.
    pub networks: Vec<WifiNetwork>,
    /// Access points of devices in configuration mode.
    pub device_aps: Vec<WifiNetwork>,
}

/// Deduplicate by SSID (strongest wins), sort by signal and split out APs
/// whose SSID starts with `ap_prefix`.
pub fn prepare_scan(networks: Vec<WifiNetwork>, ap_prefix: &str) -> ScanResult {
    let mut strongest: HashMap<String, WifiNetwork> = HashMap::new();
    for network in networks {
        match strongest.get(&network.ssid) {
            Some(seen) if seen.signal >= network.signal => {}
            _ => {
                strongest.insert(network.ssid.clone(), network);
            }
        }
    }
    let mut all: Vec<WifiNetwork> = strongest.into_values().collect();
    all.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.ssid.cmp(&b.ssid)));

    let (device_aps, networks) = all
        .into_iter()
        .partition(|n| !ap_prefix.is_empty() && n.ssid.starts_with(ap_prefix));
    ScanResult {
        networks,
        device_aps,
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A device seen in AP mode or on an operational network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device name, the registry key.
    pub device_name: String,
    /// AP-mode address.
    pub ap_ip: String,
    /// AP-mode SSID.
    pub ap_ssid: String,
    /// Address on the operational network.
    pub wifi_ip: Option<String>,
    /// Operational network.
    pub wifi_ssid: Option<String>,
}

/// Discovered devices keyed by name.
///
/// A later record for the same name replaces the earlier one whole; fields
/// are not merged.
#[derive(Clone, Debug)]
pub struct DeviceRegistry {
    devices: Arc<watch::Sender<BTreeMap<String, DiscoveredDevice>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BTreeMap::new());
        Self {
            devices: Arc::new(tx),
        }
    }

    /// Insert or replace by name.
    pub fn record(&self, device: DiscoveredDevice) {
        self.devices.send_modify(|map| {
            map.insert(device.device_name.clone(), device);
        });
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<DiscoveredDevice> {
        self.devices.borrow().get(name).cloned()
    }

    /// All devices, ordered by name.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.borrow().values().cloned().collect()
    }

    /// Watch the registry.
    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, DiscoveredDevice>> {
        self.devices.subscribe()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.devices.send_replace(BTreeMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockDeviceHttp, MockFallback};

    fn markers() -> Vec<String> {
        vec!["esp32".into(), "softstarter".into()]
    }

    fn net(ssid: &str, signal: i32) -> WifiNetwork {
        WifiNetwork {
            ssid: ssid.into(),
            signal,
            security: "WPA2".into(),
            frequency_mhz: Some(2437),
        }
    }

    #[tokio::test]
    async fn priority_list_skips_foreign_hosts() {
        let http = MockDeviceHttp::new();
        http.add_foreign_host("192.168.1.100");
        http.add_device("192.168.1.103");
        http.add_device("192.168.1.104");

        let ips = ProvisioningConfig::default().priority_ips;
        let found = probe_priority_list(&http, &ips, &markers(), Duration::from_secs(2)).await;
        assert_eq!(found.as_deref(), Some("192.168.1.103"));
    }

    #[tokio::test]
    async fn priority_walk_runs_on_a_spawned_task() {
        let http = Arc::new(MockDeviceHttp::new());
        http.add_device("192.168.0.101");
        let ips = ProvisioningConfig::default().priority_ips;

        let found = tokio::spawn({
            let http = Arc::clone(&http);
            async move { probe_priority_list(&*http, &ips, &markers(), Duration::from_secs(2)).await }
        })
        .await
        .unwrap();
        assert_eq!(found.as_deref(), Some("192.168.0.101"));
    }

    #[tokio::test]
    async fn fallback_answer_must_ping() {
        let config = ProvisioningConfig::default();
        let http = MockDeviceHttp::new();
        let fallback = MockFallback::answering("192.168.1.77");

        assert_eq!(rediscover(&http, &fallback, &config).await, None);
        assert_eq!(fallback.calls(), 1);

        http.set_alive("192.168.1.77", true);
        assert_eq!(
            rediscover(&http, &fallback, &config).await.as_deref(),
            Some("192.168.1.77")
        );
    }

    #[tokio::test]
    async fn priority_hit_skips_fallback() {
        let http = MockDeviceHttp::new();
        http.add_device("192.168.0.101");
        let fallback = MockFallback::answering("10.0.0.9");
        let found = rediscover(&http, &fallback, &ProvisioningConfig::default()).await;
        assert_eq!(found.as_deref(), Some("192.168.0.101"));
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn subnet_sweep_finds_device() {
        let http = MockDeviceHttp::new();
        http.add_foreign_host("10.0.5.1");
        http.add_device("10.0.5.42");
        let found = sweep_subnet(
            &http,
            Ipv4Addr::new(10, 0, 5, 20),
            &markers(),
            Duration::from_millis(500),
            16,
        )
        .await;
        assert_eq!(found.as_deref(), Some("10.0.5.42"));
    }

    #[test]
    fn scan_dedup_sort_and_split() {
        let result = prepare_scan(
            vec![
                net("HomeNet", 40),
                net("ESP32-SoftStart", 90),
                net("HomeNet", 75),
                net("Neighbour", 60),
            ],
            "ESP32",
        );
        let names: Vec<&str> = result.networks.iter().map(|n| n.ssid.as_str()).collect();
        assert_eq!(names, vec!["HomeNet", "Neighbour"]);
        assert_eq!(result.networks[0].signal, 75);
        assert_eq!(result.device_aps.len(), 1);
        assert_eq!(result.device_aps[0].ssid, "ESP32-SoftStart");
    }

    #[test]
    fn registry_last_write_wins() {
        let registry = DeviceRegistry::new();
        registry.record(DiscoveredDevice {
            device_name: "ESP32-A".into(),
            ap_ip: "192.168.4.1".into(),
            ap_ssid: "ESP32-A".into(),
            wifi_ip: Some("192.168.1.50".into()),
            wifi_ssid: Some("HomeNet".into()),
        });
        registry.record(DiscoveredDevice {
            device_name: "ESP32-A".into(),
            ap_ip: "192.168.4.1".into(),
            ap_ssid: "ESP32-A".into(),
            wifi_ip: None,
            wifi_ssid: None,
        });
        let devices = registry.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].wifi_ip, None);
    }
}
