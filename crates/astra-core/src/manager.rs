//! Top-level device manager.
//!
//! Owns the transport, the temp directory, and one orchestrator thread per
//! discovered device. Translates device lifecycles into the manager-level
//! event stream and latches the process failure bit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context as _, Result};
use tracing::{debug, error, info, warn};

use crate::boot_image::BootImage;
use crate::collection::BootImageCollection;
use crate::device::AstraDevice;
use crate::events::{
    DeviceStatus, DeviceUpdate, Event, EventObserver, ManagerStatus, ManagerUpdate,
};
use crate::flash_image::FlashImage;
use crate::transport::{
    DeviceAddedCallback, DiscoveredDevice, PlatformTransport, PortFilter, Transport,
    TransportError,
};
use crate::usb::{UsbError, UsbSession};

#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Keep serving new devices after the first one completes.
    pub run_continuously: bool,
    /// Comma-separated USB path prefixes; empty accepts every port.
    pub filter_ports: String,
    /// Working directory; a fresh one under the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    pub usb_debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerMode {
    Boot,
    Update,
}

struct Launch {
    mode: ManagerMode,
    boot_image: Arc<BootImage>,
    flash_image: Option<Arc<FlashImage>>,
    boot_command: String,
}

/// Observer wrapper that latches the failure bit (and temp-dir retention)
/// before forwarding.
struct ObserverGate {
    inner: Arc<dyn EventObserver>,
    failure: AtomicBool,
}

impl ObserverGate {
    fn new(inner: Arc<dyn EventObserver>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failure: AtomicBool::new(false),
        })
    }
}

impl EventObserver for ObserverGate {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Device(update) if update.status.is_failure() => {
                self.failure.store(true, Ordering::SeqCst);
            }
            Event::Manager(update) if update.status == ManagerStatus::Failure => {
                self.failure.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        self.inner.on_event(event);
    }
}

struct ManagerInner {
    observer: Arc<ObserverGate>,
    config: ManagerConfig,
    temp_dir: PathBuf,
    remove_temp_on_close: bool,
    claims: Arc<crate::transport::ClaimRegistry>,
    transport: Mutex<Option<PlatformTransport>>,
    launch: Mutex<Option<Arc<Launch>>>,
    devices: Mutex<Vec<Arc<AstraDevice<UsbSession>>>>,
    device_threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Boots (and optionally updates) every matching device that appears.
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    pub fn new(config: ManagerConfig, observer: Arc<dyn EventObserver>) -> Result<Self> {
        static TEMP_DIR_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let (temp_dir, remove_temp_on_close) = match &config.temp_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "astra-update-{}-{}",
                    std::process::id(),
                    TEMP_DIR_SEQ.fetch_add(1, Ordering::Relaxed)
                )),
                true,
            ),
        };
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("creating temp directory {}", temp_dir.display()))?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                observer: ObserverGate::new(observer),
                config,
                temp_dir,
                remove_temp_on_close,
                claims: Arc::new(crate::transport::ClaimRegistry::new()),
                transport: Mutex::new(None),
                launch: Mutex::new(None),
                devices: Mutex::new(Vec::new()),
                device_threads: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Boot every arriving device with the given boot image.
    pub fn boot(&self, boot_image_path: &Path, boot_command: &str) -> Result<()> {
        let boot_image = BootImage::load(boot_image_path)?;
        self.start(
            ManagerMode::Boot,
            Arc::new(boot_image),
            None,
            boot_command.to_string(),
        )
    }

    /// Boot and then flash every arriving device. The boot image is picked
    /// from the collection to match the flash image.
    pub fn update(&self, flash_image: FlashImage, boot_images_path: &Path) -> Result<()> {
        let collection = BootImageCollection::load(boot_images_path)?;
        let boot_image = collection.select(&flash_image)?;
        // With uEnv support the flash command rides in uEnv.txt.
        let boot_command = flash_image.flash_command.clone();
        self.start(
            ManagerMode::Update,
            Arc::new(boot_image),
            Some(Arc::new(flash_image)),
            boot_command,
        )
    }

    fn start(
        &self,
        mode: ManagerMode,
        boot_image: Arc<BootImage>,
        flash_image: Option<Arc<FlashImage>>,
        boot_command: String,
    ) -> Result<()> {
        let inner = &self.inner;

        self.emit_manager(ManagerStatus::Info, boot_image.description());

        let vendor_id = boot_image.vendor_id;
        let product_id = boot_image.product_id;
        *inner.launch.lock().unwrap() = Some(Arc::new(Launch {
            mode,
            boot_image,
            flash_image,
            boot_command,
        }));

        let callback: DeviceAddedCallback = {
            let inner = inner.clone();
            Arc::new(move |discovered| ManagerInner::device_added(&inner, discovered))
        };
        match self.start_transport(vendor_id, product_id, callback) {
            Ok(transport) => *inner.transport.lock().unwrap() = Some(transport),
            Err(e) => {
                self.emit_manager(
                    ManagerStatus::Failure,
                    format!("Failed to initialize USB transport: {e}"),
                );
                return Err(e.into());
            }
        }
        debug!("USB transport initialized successfully");

        self.emit_manager(
            ManagerStatus::Start,
            format!("Waiting for Astra Device ({vendor_id:04X}:{product_id:04X})"),
        );
        Ok(())
    }

    fn start_transport(
        &self,
        vendor_id: u16,
        product_id: u16,
        callback: DeviceAddedCallback,
    ) -> Result<PlatformTransport, TransportError> {
        let filter = PortFilter::parse(&self.inner.config.filter_ports);
        #[cfg(windows)]
        let mut transport = PlatformTransport::new(
            filter,
            self.inner.claims.clone(),
            self.inner.config.usb_debug,
        )?;
        #[cfg(not(windows))]
        let mut transport = PlatformTransport::new(filter, self.inner.config.usb_debug)?;

        transport.start(vendor_id, product_id, callback)?;
        Ok(transport)
    }

    /// Enter the cross-process critical section (no-op where the platform
    /// does not need one).
    pub fn block_enumeration(&self) -> Result<(), TransportError> {
        self.inner.block_enumeration()
    }

    pub fn unblock_enumeration(&self) {
        self.inner.unblock_enumeration()
    }

    /// Stop discovery, close every device, and clean up. Returns true when
    /// a failure was reported; the temp directory (with the console logs)
    /// is retained in that case.
    pub fn shutdown(&self) -> bool {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return inner.observer.failure.load(Ordering::SeqCst);
        }

        if let Some(mut transport) = inner.transport.lock().unwrap().take() {
            transport.shutdown();
        }

        for device in inner.devices.lock().unwrap().drain(..) {
            device.close();
        }
        for handle in inner.device_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        let failure = inner.observer.failure.load(Ordering::SeqCst);
        if inner.remove_temp_on_close && !failure {
            if let Err(e) = std::fs::remove_dir_all(&inner.temp_dir) {
                warn!(error = %e, "Failed to remove temp directory");
            }
        }

        failure
    }

    pub fn temp_dir(&self) -> &Path {
        &self.inner.temp_dir
    }

    pub fn failure_reported(&self) -> bool {
        self.inner.observer.failure.load(Ordering::SeqCst)
    }

    fn emit_manager(&self, status: ManagerStatus, message: String) {
        self.inner
            .observer
            .on_event(&Event::Manager(ManagerUpdate { status, message }));
    }
}

impl ManagerInner {
    fn block_enumeration(&self) -> Result<(), TransportError> {
        let transport = self.transport.lock().unwrap();
        match transport.as_ref() {
            Some(transport) => transport.block_enumeration(),
            None => Ok(()),
        }
    }

    fn unblock_enumeration(&self) {
        let transport = self.transport.lock().unwrap();
        if let Some(transport) = transport.as_ref() {
            transport.unblock_enumeration();
        }
    }

    fn device_added(inner: &Arc<ManagerInner>, discovered: DiscoveredDevice) {
        debug!(usb_path = %discovered.usb_path, "Device added");

        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if !inner.claims.claim(&discovered.usb_path) {
            debug!(usb_path = %discovered.usb_path, "Device already has a session");
            return;
        }

        let launch = match inner.launch.lock().unwrap().clone() {
            Some(launch) => launch,
            None => {
                error!("Device arrived before the manager was started");
                inner.claims.release(&discovered.usb_path);
                return;
            }
        };

        let usb_path = discovered.usb_path.clone();
        let session = Arc::new(UsbSession::new(discovered.device, discovered.usb_path));
        let observer: Arc<dyn EventObserver> = inner.observer.clone();
        let device = Arc::new(AstraDevice::new(
            session,
            observer,
            &inner.temp_dir,
            launch.mode == ManagerMode::Boot,
            &launch.boot_command,
        ));

        inner.observer.on_event(&Event::Device(DeviceUpdate {
            device: device.device_name().to_string(),
            status: DeviceStatus::Added,
            progress: 0.0,
            image: String::new(),
            message: String::new(),
        }));

        inner.devices.lock().unwrap().push(device.clone());

        let thread = {
            let inner = inner.clone();
            std::thread::spawn(move || Self::run_device(&inner, device, launch, usb_path))
        };
        inner.device_threads.lock().unwrap().push(thread);
    }

    fn run_device(
        inner: &Arc<ManagerInner>,
        device: Arc<AstraDevice<UsbSession>>,
        launch: Arc<Launch>,
        usb_path: String,
    ) {
        debug!(device = %device.device_name(), "Booting device");

        // Opening the session can reset a half-enumerated device; keep
        // other host processes out of the window.
        let blocked = inner.block_enumeration().is_ok();
        let boot_result = device.boot(&launch.boot_image);
        if blocked {
            inner.unblock_enumeration();
        }

        if let Err(e) = boot_result {
            if matches!(
                e.downcast_ref::<UsbError>(),
                Some(UsbError::TransientDeviceState)
            ) {
                info!(device = %device.device_name(), "Device in transient state, waiting for rediscovery");
            } else {
                error!(error = %e, "Failed to boot device");
                inner.observer.on_event(&Event::Device(DeviceUpdate {
                    device: device.device_name().to_string(),
                    status: DeviceStatus::BootFail,
                    progress: 0.0,
                    image: String::new(),
                    message: "Failed to Boot Device".to_string(),
                }));
            }
            device.close();
            inner.claims.release(&usb_path);
            return;
        }

        if let (ManagerMode::Update, Some(flash_image)) = (launch.mode, launch.flash_image.as_ref())
        {
            if let Err(e) = device.update(flash_image) {
                error!(error = %e, "Failed to update device");
                device.close();
                inner.claims.release(&usb_path);
                return;
            }
        }

        if let Err(e) = device.wait_for_completion() {
            error!(error = %e, "Failed to wait for completion");
        }

        let status = device.status();
        debug!(device = %device.device_name(), status = %status, "Device finished");

        let done = match launch.mode {
            ManagerMode::Update => status == DeviceStatus::UpdateComplete,
            ManagerMode::Boot => status == DeviceStatus::BootComplete,
        };
        if done && !inner.config.run_continuously {
            debug!("Shutting down device manager");
            inner.observer.on_event(&Event::Manager(ManagerUpdate {
                status: ManagerStatus::Shutdown,
                message: "Astra Device Manager shutting down".to_string(),
            }));
        }

        device.close();
        inner.claims.release(&usb_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;

    #[test]
    fn observer_gate_latches_failures() {
        let gate = ObserverGate::new(Arc::new(NullObserver));
        assert!(!gate.failure.load(Ordering::SeqCst));

        gate.on_event(&Event::Device(DeviceUpdate {
            device: "device:1-2".to_string(),
            status: DeviceStatus::BootProgress,
            progress: 0.0,
            image: String::new(),
            message: String::new(),
        }));
        assert!(!gate.failure.load(Ordering::SeqCst));

        gate.on_event(&Event::Device(DeviceUpdate {
            device: "device:1-2".to_string(),
            status: DeviceStatus::UpdateFail,
            progress: 0.0,
            image: String::new(),
            message: "boom".to_string(),
        }));
        assert!(gate.failure.load(Ordering::SeqCst));
    }

    #[test]
    fn temp_dir_lifecycle() {
        let manager = DeviceManager::new(ManagerConfig::default(), Arc::new(NullObserver)).unwrap();
        let temp_dir = manager.temp_dir().to_path_buf();
        assert!(temp_dir.exists());
        assert!(!manager.shutdown());
        assert!(!temp_dir.exists());
    }

    #[test]
    fn failure_retains_temp_dir() {
        let manager = DeviceManager::new(ManagerConfig::default(), Arc::new(NullObserver)).unwrap();
        let temp_dir = manager.temp_dir().to_path_buf();

        manager.inner.observer.on_event(&Event::Device(DeviceUpdate {
            device: "device:1-2".to_string(),
            status: DeviceStatus::BootFail,
            progress: 0.0,
            image: String::new(),
            message: String::new(),
        }));

        assert!(manager.shutdown());
        assert!(temp_dir.exists());
        std::fs::remove_dir_all(&temp_dir).ok();
    }
}
