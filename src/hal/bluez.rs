//! BlueZ implementation of [`SppAdapter`] through `bluer`.
//!
//! Inquiry runs as a spawned task over `discover_devices`; dropping that
//! stream is what stops BlueZ scanning, so [`SppAdapter::stop_discovery`]
//! aborts the task. RFCOMM streams are obtained by registering a client
//! profile for the service UUID and asking the device to connect it.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::traits::{BluetoothDevice, DiscoveryEvent, SppAdapter, TransportError};

/// How long BlueZ gets to hand over the RFCOMM socket after `connect_profile`.
const PROFILE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn bt_error(e: bluer::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

/// The default BlueZ adapter.
pub struct BluezAdapter {
    session: Session,
    adapter: Adapter,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezAdapter {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await.map_err(bt_error)?;
        let adapter = session.default_adapter().await.map_err(bt_error)?;
        if !adapter.is_powered().await.map_err(bt_error)? {
            info!("Powering on Bluetooth adapter {}", adapter.name());
            adapter.set_powered(true).await.map_err(bt_error)?;
        }
        Ok(Self {
            session,
            adapter,
            discovery: Mutex::new(None),
        })
    }

    /// Adapter name, e.g. `hci0`.
    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
        }
    }
}

async fn run_discovery(adapter: Adapter, tx: mpsc::Sender<DiscoveryEvent>) {
    let events = match adapter.discover_devices().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Bluetooth inquiry failed to start: {}", e);
            let _ = tx.send(DiscoveryEvent::Finished).await;
            return;
        }
    };
    let mut events = Box::pin(events);
    let mut reported = HashSet::new();

    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        if !reported.insert(address) {
            continue;
        }
        let name = match adapter.device(address) {
            Ok(device) => device.name().await.unwrap_or_default(),
            Err(_) => None,
        };
        let device = BluetoothDevice::new(name.as_deref(), address.to_string());
        debug!("Bluetooth device found: {}", device);
        if tx.send(DiscoveryEvent::DeviceFound(device)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(DiscoveryEvent::Finished).await;
}

impl SppAdapter for BluezAdapter {
    type Stream = BluezStream;

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(run_discovery(self.adapter.clone(), tx));
        if let Some(previous) = self.discovery.lock().replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_discovery(&self) {
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
        }
    }

    async fn open_rfcomm(&self, address: &str, service: Uuid) -> Result<BluezStream, TransportError> {
        let address = Address::from_str(address)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", address, e)))?;
        let device = self.adapter.device(address).map_err(bt_error)?;

        let profile = Profile {
            uuid: service,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = Box::pin(
            self.session
                .register_profile(profile)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?,
        );

        // connect_profile only returns once the profile handler has accepted
        let connect = tokio::spawn(async move { device.connect_profile(&service).await });

        let request = match tokio::time::timeout(PROFILE_CONNECT_TIMEOUT, handle.next()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                connect.abort();
                return Err(TransportError::Connect("profile handler closed".to_string()));
            }
            Err(_) => {
                connect.abort();
                return Err(TransportError::Timeout);
            }
        };
        let stream = request
            .accept()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        match connect.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("connect_profile reported after accept: {}", e),
            Err(e) => debug!("connect_profile task ended: {}", e),
        }
        info!("RFCOMM stream open to {}", address);
        Ok(BluezStream {
            stream,
            _profile: handle,
        })
    }
}

/// RFCOMM stream that keeps its profile registration alive.
pub struct BluezStream {
    stream: Stream,
    _profile: Pin<Box<ProfileHandle>>,
}

impl AsyncRead for BluezStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BluezStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
