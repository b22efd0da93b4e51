//! Desktop host implementations: WiFi state via `nmcli`, a UDP broadcast
//! fallback for device discovery, and the adapter for hosts without a
//! Bluetooth radio.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, info};
use tokio::io::DuplexStream;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::traits::{
    DiscoveryEvent, FallbackDiscovery, SppAdapter, TransportError, WifiError, WifiInfo,
    WifiNetwork,
};

// ============================================================================
// nmcli
// ============================================================================

/// Split one `nmcli -t` line on unescaped `:` and unescape `\:` / `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY,FREQ dev wifi list` output.
///
/// Hidden networks (empty SSID) are skipped.
pub fn parse_scan(output: &str) -> Vec<WifiNetwork> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            let [ssid, signal, security, freq] = fields.as_slice() else {
                return None;
            };
            if ssid.is_empty() {
                return None;
            }
            Some(WifiNetwork {
                ssid: ssid.clone(),
                signal: signal.trim().parse().unwrap_or(0),
                security: security.clone(),
                frequency_mhz: freq
                    .split_whitespace()
                    .next()
                    .and_then(|f| f.parse().ok()),
            })
        })
        .collect()
}

/// Parse `nmcli -t -f ACTIVE,SSID dev wifi` output into the active SSID.
pub fn parse_active_ssid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [active, ssid] if active == "yes" && !ssid.is_empty() => Some(ssid.clone()),
            _ => None,
        }
    })
}

/// Host WiFi through NetworkManager's `nmcli`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NmcliWifi;

impl NmcliWifi {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<String, WifiError> {
        let output = Command::new("nmcli")
            .args(args)
            .output()
            .await
            .map_err(|e| WifiError(format!("nmcli: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WifiError(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WifiInfo for NmcliWifi {
    async fn current_ssid(&self) -> Option<String> {
        match Self::run(&["-t", "-f", "ACTIVE,SSID", "dev", "wifi"]).await {
            Ok(out) => parse_active_ssid(&out),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }

    async fn scan(&self) -> Result<Vec<WifiNetwork>, WifiError> {
        let out = Self::run(&[
            "-t",
            "-f",
            "SSID,SIGNAL,SECURITY,FREQ",
            "dev",
            "wifi",
            "list",
            "--rescan",
            "yes",
        ])
        .await?;
        Ok(parse_scan(&out))
    }

    async fn current_ipv4(&self) -> Option<Ipv4Addr> {
        // Connecting a UDP socket sends nothing; it only picks the route
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }
}

// ============================================================================
// UDP broadcast
// ============================================================================

/// Port the firmware listens on for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 4210;

/// Payload of a discovery broadcast.
pub const DISCOVERY_QUERY: &[u8] = b"SOFTSTARTER_DISCOVER";

/// Broadcast discovery.
///
/// Sends one query to the LAN broadcast address and returns the source of
/// the first reply that mentions a marker. Best effort: networks that
/// filter broadcast, or firmware that does not answer, simply yield `None`.
#[derive(Clone, Debug)]
pub struct UdpBroadcastDiscovery {
    target: SocketAddr,
    markers: Vec<String>,
}

impl UdpBroadcastDiscovery {
    /// Broadcast to `255.255.255.255:port`, accepting replies mentioning any marker.
    pub fn new(port: u16, markers: Vec<String>) -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            markers,
        }
    }

    /// Send to `target` instead of the broadcast address.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    fn accepts(&self, reply: &[u8]) -> bool {
        let text = String::from_utf8_lossy(reply).to_ascii_lowercase();
        self.markers
            .iter()
            .any(|m| !m.is_empty() && text.contains(&m.to_ascii_lowercase()))
    }

    async fn query(&self, timeout: Duration) -> std::io::Result<Option<String>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket.send_to(DISCOVERY_QUERY, self.target).await?;
        let mut buf = [0u8; 512];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            match recv {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Ok(Ok((n, from))) if self.accepts(&buf[..n]) => {
                    return Ok(Some(from.ip().to_string()));
                }
                Ok(Ok((_, from))) => debug!("ignoring discovery reply from {}", from),
            }
        }
    }
}

impl FallbackDiscovery for UdpBroadcastDiscovery {
    async fn discover(&self, timeout: Duration) -> Option<String> {
        match self.query(timeout).await {
            Ok(Some(ip)) => {
                info!("broadcast discovery answered from {}", ip);
                Some(ip)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("broadcast discovery failed: {}", e);
                None
            }
        }
    }
}

// ============================================================================
// No radio
// ============================================================================

/// Adapter for hosts without Bluetooth, such as MQTT-only sessions.
///
/// Inquiry and RFCOMM opens fail with a descriptive error.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBluetooth;

impl SppAdapter for NoBluetooth {
    type Stream = DuplexStream;

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        Err(TransportError::Discovery("no Bluetooth adapter on this host".to_string()))
    }

    async fn stop_discovery(&self) {}

    async fn open_rfcomm(&self, address: &str, _service: Uuid) -> Result<DuplexStream, TransportError> {
        Err(TransportError::Connect(format!(
            "no Bluetooth adapter on this host to reach {}",
            address
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terse_split_unescapes() {
        assert_eq!(split_terse(r"My\:Net:70:WPA2:2437 MHz"), vec!["My:Net", "70", "WPA2", "2437 MHz"]);
        assert_eq!(split_terse("a::b"), vec!["a", "", "b"]);
    }

    #[test]
    fn scan_output_parses() {
        let out = "HomeNet:82:WPA2:5180 MHz\n:40:WPA2:2412 MHz\nESP32-Setup:90::2437 MHz\n";
        let networks = parse_scan(out);
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "HomeNet");
        assert_eq!(networks[0].signal, 82);
        assert_eq!(networks[0].frequency_mhz, Some(5180));
        assert!(!networks[1].is_secured());
    }

    #[test]
    fn active_ssid_parses() {
        assert_eq!(
            parse_active_ssid("no:Neighbour\nyes:HomeNet\n"),
            Some("HomeNet".to_string())
        );
        assert_eq!(parse_active_ssid("no:Neighbour\n"), None);
    }

    #[tokio::test]
    async fn broadcast_reply_is_accepted() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = device.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"ESP32 SoftStarter", from).await.unwrap();
        });

        let discovery = UdpBroadcastDiscovery::new(DISCOVERY_PORT, vec!["softstarter".into()])
            .with_target(target);
        assert_eq!(
            discovery.discover(Duration::from_secs(2)).await,
            Some("127.0.0.1".to_string())
        );
    }

    #[tokio::test]
    async fn silent_network_yields_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery = UdpBroadcastDiscovery::new(DISCOVERY_PORT, vec!["esp32".into()])
            .with_target(silent.local_addr().unwrap());
        assert_eq!(discovery.discover(Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn no_bluetooth_refuses_everything() {
        assert!(matches!(
            NoBluetooth.start_discovery().await,
            Err(TransportError::Discovery(_))
        ));
        assert!(matches!(
            NoBluetooth.open_rfcomm("AA:BB:CC:DD:EE:FF", crate::traits::SPP_UUID).await,
            Err(TransportError::Connect(_))
        ));
    }
}
