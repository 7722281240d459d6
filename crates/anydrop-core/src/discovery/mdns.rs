//! mDNS/DNS-SD advertisement and browsing for AnyDrop.
//!
//! Complements the subnet scan: a host running `serve` registers itself as
//! `_anydrop._tcp.local.`, and scanners browse for that service type to pick
//! up peers the /24 sweep cannot reach.
//!
//! ## TXT record
//!
//! | Key       | Value                          |
//! |-----------|--------------------------------|
//! | `app`     | `AnyDrop`                      |
//! | `version` | Host version                   |
//! | `type`    | Device class (`LAPTOP`, ...)   |
//! | `name`    | Display name                   |
//! | `id`      | Device id                      |
//! | `ip`      | Advertised IPv4, when known    |

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Mutex;

use super::{Device, DeviceClass};
use crate::error::{Error, Result};

/// mDNS service type for AnyDrop.
pub const SERVICE_TYPE: &str = "_anydrop._tcp.local.";

/// Bound on waiting for the daemon to confirm an unregister or shutdown.
const DAEMON_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// TXT record keys for service properties.
pub mod txt_keys {
    /// Application name key
    pub const APP: &str = "app";
    /// Version key
    pub const VERSION: &str = "version";
    /// Device class key
    pub const DEVICE_TYPE: &str = "type";
    /// Display name key
    pub const NAME: &str = "name";
    /// Device id key
    pub const ID: &str = "id";
    /// Advertised address key
    pub const IP: &str = "ip";
}

/// What a host advertises about itself.
#[derive(Debug, Clone)]
pub struct MdnsProperties {
    /// Device id
    pub device_id: String,
    /// Display name
    pub device_name: String,
    /// Device class
    pub class: DeviceClass,
    /// Acceptor host port
    pub port: u16,
    /// Advertised IPv4 address; the daemon picks interfaces when unset
    pub address: Option<Ipv4Addr>,
}

impl MdnsProperties {
    /// Convert to TXT record properties.
    #[must_use]
    pub fn to_txt_properties(&self) -> Vec<(&'static str, String)> {
        let mut txt = vec![
            (txt_keys::APP, crate::APP_IDENTITY.to_string()),
            (txt_keys::VERSION, crate::VERSION.to_string()),
            (txt_keys::DEVICE_TYPE, self.class.wire_name().to_string()),
            (txt_keys::NAME, self.device_name.clone()),
            (txt_keys::ID, self.device_id.clone()),
        ];
        if let Some(ip) = self.address {
            txt.push((txt_keys::IP, ip.to_string()));
        }
        txt
    }

    /// Instance name the service is registered under.
    #[must_use]
    pub fn instance_name(&self) -> String {
        format!("AnyDrop-{}", self.device_name)
    }
}

/// Build a device from a resolved AnyDrop service.
///
/// Returns `None` for services of other apps or without an IPv4 address.
#[must_use]
pub fn device_from_service(info: &ServiceInfo) -> Option<Device> {
    let properties = info.get_properties();
    let get_str =
        |key: &str| -> Option<String> { properties.get(key).map(|p| p.val_str().to_string()) };

    if get_str(txt_keys::APP).is_some_and(|app| app != crate::APP_IDENTITY) {
        return None;
    }

    let address = info
        .get_addresses()
        .iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .or_else(|| get_str(txt_keys::IP).and_then(|ip| ip.parse().ok()))?;

    let name = get_str(txt_keys::NAME)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| instance_of(info.get_fullname()).to_string());

    let mut device = Device::new(address, info.get_port(), name);
    if let Some(class) = get_str(txt_keys::DEVICE_TYPE) {
        device.class = DeviceClass::parse(&class);
    }
    Some(device)
}

/// `"AnyDrop-Desk._anydrop._tcp.local."` -> `"AnyDrop-Desk"`
fn instance_of(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map_or(fullname, |rest| rest.trim_end_matches('.'))
}

fn mdns_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Mdns(format!("{context}: {e}"))
}

fn local_host_name() -> String {
    let raw = hostname::get().map_or_else(
        |_| "localhost".to_string(),
        |h| h.to_string_lossy().to_string(),
    );

    if raw.ends_with(".local.") {
        raw
    } else if raw.to_lowercase().ends_with(".local") {
        format!("{raw}.")
    } else {
        format!("{raw}.local.")
    }
}

fn shutdown_daemon(daemon: ServiceDaemon, role: &str) {
    match daemon.shutdown() {
        Ok(receiver) => match receiver.recv_timeout(DAEMON_ACK_TIMEOUT) {
            Ok(status) => tracing::debug!("mDNS {} shut down: {:?}", role, status),
            Err(flume::RecvTimeoutError::Timeout) => {
                tracing::debug!("mDNS {} shutdown timed out", role);
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                tracing::debug!("mDNS {} shutdown channel disconnected", role);
            }
        },
        Err(e) => tracing::debug!("mDNS {} shutdown failed: {}", role, e),
    }
}

// ============================================================================
// Advertising
// ============================================================================

/// Registers the local acceptor host as an mDNS service.
pub struct MdnsAdvertiser {
    daemon: Option<ServiceDaemon>,
    registered: Mutex<Option<String>>,
}

impl std::fmt::Debug for MdnsAdvertiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsAdvertiser").finish_non_exhaustive()
    }
}

impl MdnsAdvertiser {
    /// Start an mDNS daemon for advertising.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| mdns_error("mDNS daemon error", e))?;
        Ok(Self {
            daemon: Some(daemon),
            registered: Mutex::new(None),
        })
    }

    /// Advertise the host. Returns the registered full service name.
    pub async fn register(&self, properties: &MdnsProperties) -> Result<String> {
        let daemon = self
            .daemon
            .as_ref()
            .ok_or_else(|| Error::Mdns("daemon already shut down".into()))?;

        let instance = properties.instance_name();
        let txt = properties.to_txt_properties();
        let host = local_host_name();
        let info = match properties.address {
            Some(ip) => ServiceInfo::new(
                SERVICE_TYPE,
                &instance,
                &host,
                ip.to_string().as_str(),
                properties.port,
                txt.as_slice(),
            ),
            None => ServiceInfo::new(SERVICE_TYPE, &instance, &host, (), properties.port, txt.as_slice())
                .map(ServiceInfo::enable_addr_auto),
        }
        .map_err(|e| mdns_error("Failed to create mDNS service info", e))?;

        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|e| mdns_error("Failed to register mDNS service", e))?;
        *self.registered.lock().await = Some(fullname.clone());

        tracing::info!("Advertising {} on port {} via mDNS", instance, properties.port);
        Ok(fullname)
    }

    /// Withdraw the advertisement, if any.
    pub async fn unregister(&self) -> Result<()> {
        let Some(fullname) = self.registered.lock().await.take() else {
            return Ok(());
        };
        let daemon = self
            .daemon
            .as_ref()
            .ok_or_else(|| Error::Mdns("daemon already shut down".into()))?;
        let receiver = daemon
            .unregister(&fullname)
            .map_err(|e| mdns_error("Failed to unregister mDNS service", e))?;

        match tokio::time::timeout(DAEMON_ACK_TIMEOUT, receiver.recv_async()).await {
            Ok(Ok(status)) => tracing::debug!("mDNS unregister of {}: {:?}", fullname, status),
            Ok(Err(e)) => tracing::debug!("mDNS unregister channel closed: {}", e),
            Err(_) => tracing::debug!("mDNS unregister of {} timed out", fullname),
        }
        tracing::info!("Stopped advertising {}", fullname);
        Ok(())
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            shutdown_daemon(daemon, "advertiser");
        }
    }
}

// ============================================================================
// Browsing
// ============================================================================

/// Browses for AnyDrop hosts advertised over mDNS.
pub struct MdnsBrowser {
    daemon: Option<ServiceDaemon>,
    receiver: flume::Receiver<ServiceEvent>,
}

impl std::fmt::Debug for MdnsBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsBrowser").finish_non_exhaustive()
    }
}

impl MdnsBrowser {
    /// Start browsing for `_anydrop._tcp`.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| mdns_error("mDNS daemon error", e))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| mdns_error("Failed to browse mDNS services", e))?;
        Ok(Self {
            daemon: Some(daemon),
            receiver,
        })
    }

    /// Collect the hosts that resolve within `duration`.
    ///
    /// A host that is withdrawn before the window closes is left out.
    pub async fn scan(&self, duration: Duration) -> Vec<Device> {
        let mut found: HashMap<String, Device> = HashMap::new();
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(device) = device_from_service(&info) {
                        tracing::debug!("mDNS: {} at {}", device.display_name, device.id);
                        found.insert(info.get_fullname().to_string(), device);
                    }
                }
                Ok(Ok(ServiceEvent::ServiceRemoved(_, fullname))) => {
                    if let Some(device) = found.remove(&fullname) {
                        tracing::debug!("mDNS: {} went away", device.display_name);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let mut devices: Vec<Device> = found.into_values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices.dedup_by(|a, b| a.id == b.id);
        devices
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!("Failed to stop mDNS browse: {}", e);
            }
            shutdown_daemon(daemon, "browser");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> MdnsProperties {
        MdnsProperties {
            device_id: "desk-1".to_string(),
            device_name: "Desk".to_string(),
            class: DeviceClass::Desktop,
            port: 8080,
            address: Some(Ipv4Addr::new(192, 168, 1, 42)),
        }
    }

    fn service(properties: &MdnsProperties, ip: &str) -> ServiceInfo {
        ServiceInfo::new(
            SERVICE_TYPE,
            &properties.instance_name(),
            "desk.local.",
            ip,
            properties.port,
            properties.to_txt_properties().as_slice(),
        )
        .unwrap()
    }

    #[test]
    fn test_txt_properties() {
        let txt = properties().to_txt_properties();
        let get = |key: &str| txt.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());

        assert_eq!(get(txt_keys::APP), Some("AnyDrop"));
        assert_eq!(get(txt_keys::DEVICE_TYPE), Some("DESKTOP"));
        assert_eq!(get(txt_keys::ID), Some("desk-1"));
        assert_eq!(get(txt_keys::IP), Some("192.168.1.42"));

        let unaddressed = MdnsProperties {
            address: None,
            ..properties()
        };
        assert!(unaddressed
            .to_txt_properties()
            .iter()
            .all(|(k, _)| *k != txt_keys::IP));
    }

    #[test]
    fn test_resolved_service_becomes_device() {
        let props = properties();
        let device = device_from_service(&service(&props, "192.168.1.42")).unwrap();

        assert_eq!(device.id, "192.168.1.42:8080");
        assert_eq!(device.display_name, "Desk");
        assert_eq!(device.class, DeviceClass::Desktop);
    }

    #[test]
    fn test_other_apps_are_ignored() {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "Printer",
            "printer.local.",
            "192.168.1.9",
            631,
            [("app", "SomethingElse".to_string())].as_slice(),
        )
        .unwrap();
        assert!(device_from_service(&info).is_none());
    }

    #[test]
    fn test_instance_name_from_fullname() {
        assert_eq!(instance_of("AnyDrop-Desk._anydrop._tcp.local."), "AnyDrop-Desk");
        assert_eq!(instance_of("odd"), "odd");
    }

    #[test]
    fn test_service_type_format() {
        assert!(SERVICE_TYPE.starts_with("_anydrop._tcp"));
        assert!(SERVICE_TYPE.ends_with(".local."));
    }
}
