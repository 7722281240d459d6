//! Network discovery for AnyDrop.
//!
//! Peers are found by actively probing every host of the local /24 subnet
//! with an identification request. With the `mdns` feature, hosts also
//! advertise `_anydrop._tcp` and browsed peers can be merged into the same
//! registry (see [`mdns`]).
//!
//! ## Protocol
//!
//! - Probe: `GET http://{host}:8080/api/identify`, bounded to 1 second
//! - Valid peer: HTTP 200 with `{"app": "AnyDrop", ...}`
//! - Device id: `"{host}:{port}"`
//!
//! ## Registry
//!
//! Results are merged into the scanner's device list as they arrive, and a
//! [`DeviceListChanged`] snapshot is published after every change. Devices
//! that are not re-confirmed during a pass are dropped when the pass ends.

#[cfg(feature = "mdns")]
pub mod mdns;
pub mod probe;

pub use probe::{HttpProber, Probe};

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::config::Config;
use crate::protocol::IdentityResponse;

/// Display name used when a peer does not send one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Kind of device a peer reports itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Phone
    Phone,
    /// Laptop
    #[default]
    Laptop,
    /// Tablet
    Tablet,
    /// Desktop computer
    Desktop,
}

impl DeviceClass {
    /// Parse a reported class, case-insensitively. Unknown values are laptops.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "phone" | "mobile" => Self::Phone,
            "tablet" => Self::Tablet,
            "desktop" => Self::Desktop,
            _ => Self::Laptop,
        }
    }

    /// Wire name, upper case as the identify endpoint reports it.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Phone => "PHONE",
            Self::Laptop => "LAPTOP",
            Self::Tablet => "TABLET",
            Self::Desktop => "DESKTOP",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Phone => "phone",
            Self::Laptop => "laptop",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
        };
        f.write_str(name)
    }
}

/// Whether a device can be reached. Discovery only ever records reachable
/// devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    /// Answered its most recent probe
    #[default]
    Online,
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// `"{address}:{port}"`
    pub id: String,
    /// Name shown to the user
    pub display_name: String,
    /// Device class
    pub class: DeviceClass,
    /// Icon hint from the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// IPv4 address
    pub address: Ipv4Addr,
    /// Acceptor host port
    pub port: u16,
    /// Reachability
    pub reachability: Reachability,
}

impl Device {
    /// Create a device record for `address:port`.
    #[must_use]
    pub fn new(address: Ipv4Addr, port: u16, display_name: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(address, port),
            display_name: display_name.into(),
            class: DeviceClass::Laptop,
            icon: None,
            address,
            port,
            reachability: Reachability::Online,
        }
    }

    /// Build a device from an identify response.
    #[must_use]
    pub fn from_identity(address: Ipv4Addr, port: u16, identity: &IdentityResponse) -> Self {
        let display_name = identity
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());

        Self {
            class: identity
                .device_type
                .as_deref()
                .map(DeviceClass::parse)
                .unwrap_or_default(),
            icon: identity.icon.clone(),
            ..Self::new(address, port, display_name)
        }
    }

    /// Registry id for `address:port`.
    #[must_use]
    pub fn id_for(address: Ipv4Addr, port: u16) -> String {
        format!("{address}:{port}")
    }

    /// Socket address of the peer's acceptor host.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// A /24 IPv4 subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    prefix: [u8; 3],
}

impl Subnet {
    /// Subnet containing `address`.
    #[must_use]
    pub const fn of(address: Ipv4Addr) -> Self {
        let [a, b, c, _] = address.octets();
        Self { prefix: [a, b, c] }
    }

    /// Parse `"a.b.c"`, `"a.b.c.x"` or `"a.b.c.0/24"`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_suffix("/24").unwrap_or(value);
        let octets: Vec<u8> = value
            .trim_end_matches('.')
            .split('.')
            .map(|part| part.parse().ok())
            .collect::<Option<_>>()?;

        match octets.as_slice() {
            [a, b, c] | [a, b, c, _] => Some(Self {
                prefix: [*a, *b, *c],
            }),
            _ => None,
        }
    }

    /// Subnet of this host's outbound IPv4 address, if one can be observed.
    #[must_use]
    pub fn detect() -> Option<Self> {
        local_ipv4().map(Self::of)
    }

    /// Subnet from an optional override, then detection, then
    /// [`crate::DEFAULT_SUBNET`].
    #[must_use]
    pub fn resolve(configured: Option<&str>) -> Self {
        if let Some(value) = configured {
            match Self::parse(value) {
                Some(subnet) => return subnet,
                None => tracing::warn!("ignoring invalid subnet '{}'", value),
            }
        }
        Self::detect()
            .or_else(|| Self::parse(crate::DEFAULT_SUBNET))
            .unwrap_or(Self {
                prefix: [192, 168, 1],
            })
    }

    /// Host `suffix` within this subnet.
    #[must_use]
    pub const fn host(&self, suffix: u8) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, suffix)
    }

    /// Hosts `.1` through `.254`.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + Send + 'static {
        let subnet = *self;
        (1..=254u8).map(move |suffix| subnet.host(suffix))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{a}.{b}.{c}.0/24")
    }
}

/// This host's outbound IPv4 address.
///
/// Connecting a UDP socket sends no packets; it only asks the OS which
/// interface would route to the target.
#[must_use]
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() && !addr.ip().is_loopback() => {
            Some(*addr.ip())
        }
        _ => None,
    }
}

/// Snapshot published whenever the device list or scan status changes.
#[derive(Debug, Clone)]
pub struct DeviceListChanged {
    /// Current devices
    pub devices: Vec<Device>,
    /// Whether a scan pass is running
    pub scanning: bool,
}

struct ScannerInner<P> {
    prober: P,
    subnet: Subnet,
    concurrency: usize,
    devices: RwLock<Vec<Device>>,
    scanning: AtomicBool,
    events: broadcast::Sender<DeviceListChanged>,
}

/// Subnet scanner and owner of the device registry.
pub struct Scanner<P = HttpProber> {
    inner: Arc<ScannerInner<P>>,
}

impl<P> Clone for Scanner<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for Scanner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("subnet", &self.inner.subnet)
            .field("concurrency", &self.inner.concurrency)
            .finish_non_exhaustive()
    }
}

impl Scanner<HttpProber> {
    /// Scanner probing the configured (or detected) subnet over HTTP.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let prober = HttpProber::new(config.network.port, config.network.probe_timeout);
        let subnet = Subnet::resolve(config.network.subnet.as_deref());
        Self::new(prober, subnet, config.network.scan_concurrency)
    }
}

impl<P: Probe> Scanner<P> {
    /// Create a scanner; `concurrency` bounds the probes in flight.
    #[must_use]
    pub fn new(prober: P, subnet: Subnet, concurrency: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ScannerInner {
                prober,
                subnet,
                concurrency: concurrency.max(1),
                devices: RwLock::new(Vec::new()),
                scanning: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// The subnet being scanned.
    pub fn subnet(&self) -> Subnet {
        self.inner.subnet
    }

    /// Receive a snapshot after every registry change.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceListChanged> {
        self.inner.events.subscribe()
    }

    /// Copy of the current device list.
    pub async fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().await.clone()
    }

    /// Whether a scan pass is running.
    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::Acquire)
    }

    /// Run one scan pass over the subnet.
    ///
    /// If a pass is already running this returns the current snapshot
    /// immediately instead of starting another.
    pub async fn scan(&self) -> Vec<Device> {
        if self
            .inner
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("scan already in progress");
            return self.devices().await;
        }
        let guard = ScanGuard(&self.inner.scanning);

        tracing::info!("scanning {}", self.inner.subnet);
        self.publish().await;

        let mut confirmed = HashSet::new();
        let mut results = stream::iter(self.inner.subnet.hosts())
            .map(|address| self.inner.prober.probe(address))
            .buffer_unordered(self.inner.concurrency);

        while let Some(result) = results.next().await {
            if let Some(device) = result {
                confirmed.insert(device.id.clone());
                self.merge(device).await;
                self.publish().await;
            }
        }

        let devices = {
            let mut devices = self.inner.devices.write().await;
            devices.retain(|d| confirmed.contains(&d.id));
            devices.clone()
        };

        drop(guard);
        self.publish().await;
        tracing::info!("scan complete, {} device(s) found", devices.len());
        devices
    }

    /// Probe one address outside a subnet pass and merge the result.
    ///
    /// Any existing entry with the same address is replaced.
    pub async fn add_manual_device(&self, address: Ipv4Addr) -> Option<Device> {
        let device = self.inner.prober.probe(address).await?;
        {
            let mut devices = self.inner.devices.write().await;
            devices.retain(|d| d.address != address);
            devices.push(device.clone());
        }
        self.publish().await;
        Some(device)
    }

    /// Merge a device found by other means, such as mDNS.
    ///
    /// An entry with the same id is replaced.
    pub async fn insert_device(&self, device: Device) {
        self.merge(device).await;
        self.publish().await;
    }

    /// Drop the device with `id`. Returns whether it was listed.
    pub async fn remove_device(&self, id: &str) -> bool {
        let removed = {
            let mut devices = self.inner.devices.write().await;
            let before = devices.len();
            devices.retain(|d| d.id != id);
            devices.len() != before
        };
        if removed {
            self.publish().await;
        }
        removed
    }

    async fn merge(&self, device: Device) {
        let mut devices = self.inner.devices.write().await;
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => devices.push(device),
        }
    }

    async fn publish(&self) {
        let snapshot = DeviceListChanged {
            devices: self.devices().await,
            scanning: self.is_scanning(),
        };
        // no subscribers is fine
        let _ = self.inner.events.send(snapshot);
    }
}

/// Clears the scanning flag even if the scan future is dropped midway.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
