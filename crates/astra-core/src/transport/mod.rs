//! Device discovery: USB context lifetime, hotplug, port filtering, and
//! the cross-process critical section.

mod hotplug;
mod lock;
#[cfg(windows)]
mod windows;

pub use hotplug::HotplugTransport;
pub use lock::CriticalSection;
#[cfg(windows)]
pub use windows::WinTransport;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusb::{Context, Device, UsbContext};
use thiserror::Error;

#[cfg(windows)]
pub type PlatformTransport = WinTransport;
#[cfg(not(windows))]
pub type PlatformTransport = HotplugTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to initialize usb context: {0}")]
    Init(rusb::Error),
    #[error("this libusb build has no hotplug support")]
    HotplugUnsupported,
    #[error("failed to register hotplug callback: {0}")]
    Hotplug(rusb::Error),
    #[error("timed out acquiring the cross-process critical section")]
    MutexTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Usb(#[from] rusb::Error),
}

/// A device the transport discovered and that passed the port filter.
pub struct DiscoveredDevice {
    pub device: Device<Context>,
    pub usb_path: String,
}

pub type DeviceAddedCallback = Arc<dyn Fn(DiscoveredDevice) + Send + Sync>;

/// Platform discovery backend. One per process.
pub trait Transport: Send {
    /// Begin discovery for the (vendor, product) pair. Already-present
    /// devices are reported immediately.
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        callback: DeviceAddedCallback,
    ) -> Result<(), TransportError>;

    /// Stop discovery and join every transport thread. Idempotent.
    fn shutdown(&mut self);

    /// Enter the cross-process critical section guarding reset-sensitive
    /// enumeration windows.
    fn block_enumeration(&self) -> Result<(), TransportError>;

    fn unblock_enumeration(&self);
}

/// `"{bus}-{port.port...}"`, the stable topology path of a device.
pub fn usb_path<T: UsbContext>(device: &Device<T>) -> String {
    let ports = device.port_numbers().unwrap_or_default();
    format_usb_path(device.bus_number(), &ports)
}

pub(crate) fn format_usb_path(bus: u8, ports: &[u8]) -> String {
    let joined = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".");
    format!("{bus}-{joined}")
}

/// Comma-separated list of USB path prefixes; an empty filter accepts all.
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    prefixes: Vec<String>,
}

impl PortFilter {
    pub fn parse(list: &str) -> Self {
        let prefixes = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self { prefixes }
    }

    pub fn matches(&self, usb_path: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| usb_path.starts_with(p.as_str()))
    }
}

/// Per-process registry of USB paths with a live session. Consulted before
/// the EACCES heuristic when deciding whether an enumerated device is
/// already ours.
#[derive(Default)]
pub struct ClaimRegistry {
    paths: Mutex<HashSet<String>>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the path was already claimed.
    pub fn claim(&self, usb_path: &str) -> bool {
        self.paths.lock().unwrap().insert(usb_path.to_string())
    }

    pub fn release(&self, usb_path: &str) {
        self.paths.lock().unwrap().remove(usb_path);
    }

    pub fn is_claimed(&self, usb_path: &str) -> bool {
        self.paths.lock().unwrap().contains(usb_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_path_format() {
        assert_eq!(format_usb_path(1, &[2, 4, 1]), "1-2.4.1");
        assert_eq!(format_usb_path(3, &[9]), "3-9");
        assert_eq!(format_usb_path(2, &[]), "2-");
    }

    #[test]
    fn port_filter_prefixes() {
        let filter = PortFilter::parse("1-2,3-9");
        assert!(filter.matches("1-2.3"));
        assert!(filter.matches("3-9"));
        assert!(!filter.matches("1-3"));
        assert!(!filter.matches("2-1"));
    }

    #[test]
    fn empty_filter_accepts_all() {
        let filter = PortFilter::parse("");
        assert!(filter.matches("1-2.3"));
        let filter = PortFilter::parse(" , ");
        assert!(filter.matches("7-1"));
    }

    #[test]
    fn claim_registry() {
        let registry = ClaimRegistry::new();
        assert!(registry.claim("1-2"));
        assert!(!registry.claim("1-2"));
        assert!(registry.is_claimed("1-2"));
        registry.release("1-2");
        assert!(!registry.is_claimed("1-2"));
        assert!(registry.claim("1-2"));
    }
}
