//! libusb-hotplug discovery (Linux and macOS).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, error, info};

use super::lock::{CriticalSection, ACQUIRE_TIMEOUT};
use super::{usb_path, DeviceAddedCallback, DiscoveredDevice, PortFilter, Transport, TransportError};

const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

struct ArrivalHandler {
    filter: PortFilter,
    callback: DeviceAddedCallback,
}

impl Hotplug<Context> for ArrivalHandler {
    fn device_arrived(&mut self, device: Device<Context>) {
        let path = usb_path(&device);
        if let Ok(descriptor) = device.device_descriptor() {
            info!(
                vid = %format_args!("{:04x}", descriptor.vendor_id()),
                pid = %format_args!("{:04x}", descriptor.product_id()),
                usb_path = %path,
                "Device arrived"
            );
        }
        if !self.filter.matches(&path) {
            debug!(usb_path = %path, "Device is not on a monitored port");
            return;
        }
        (self.callback)(DiscoveredDevice {
            device,
            usb_path: path,
        });
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(usb_path = %usb_path(&device), "Device left");
    }
}

/// Hotplug-callback transport: registers for the (vendor, product) pair
/// with the ENUMERATE flag and pumps libusb events on a dedicated thread.
pub struct HotplugTransport {
    context: Context,
    filter: PortFilter,
    critical: CriticalSection,
    running: Arc<AtomicBool>,
    registration: Option<Registration<Context>>,
    pump: Option<JoinHandle<()>>,
}

impl HotplugTransport {
    pub fn new(filter: PortFilter, usb_debug: bool) -> Result<Self, TransportError> {
        let mut context = Context::new().map_err(TransportError::Init)?;
        if usb_debug {
            context.set_log_level(rusb::LogLevel::Debug);
        }
        Ok(Self {
            context,
            filter,
            critical: CriticalSection::new()?,
            running: Arc::new(AtomicBool::new(false)),
            registration: None,
            pump: None,
        })
    }
}

impl Transport for HotplugTransport {
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        callback: DeviceAddedCallback,
    ) -> Result<(), TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::HotplugUnsupported);
        }

        let handler: Box<dyn Hotplug<Context>> = Box::new(ArrivalHandler {
            filter: self.filter.clone(),
            callback,
        });
        let registration = HotplugBuilder::new()
            .vendor_id(vendor_id)
            .product_id(product_id)
            .enumerate(true)
            .register(self.context.clone(), handler)
            .map_err(TransportError::Hotplug)?;
        self.registration = Some(registration);

        self.running.store(true, Ordering::SeqCst);
        let context = self.context.clone();
        let running = self.running.clone();
        self.pump = Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match context.handle_events(Some(EVENT_TIMEOUT)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => {
                        debug!("Event handling interrupted");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to handle events");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.registration.take();
        self.context.interrupt_handle_events();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        debug!("Hotplug transport shut down");
    }

    fn block_enumeration(&self) -> Result<(), TransportError> {
        self.critical.acquire(ACQUIRE_TIMEOUT)
    }

    fn unblock_enumeration(&self) {
        self.critical.release();
    }
}

impl Drop for HotplugTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
