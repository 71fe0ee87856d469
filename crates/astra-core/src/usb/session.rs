//! The per-device USB session.
//!
//! Owns the opened device handle, the continuously posted interrupt-IN
//! transfer (realized as a pump thread), the single in-flight bulk-OUT
//! write, and the callback queue that decouples transfer completion from
//! the orchestrator's event handler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType};
use tracing::{debug, error, info, instrument, warn};

use super::link::{DeviceLink, EventSink, LinkEvent, UsbError};

const CONFIG_DESCRIPTOR_ATTEMPTS: u32 = 4;
const CONFIG_DESCRIPTOR_RETRY: Duration = Duration::from_millis(100);
/// Poll interval of the interrupt-IN pump; bounds how long `close` waits
/// for the in-flight transfer to drain.
const INTERRUPT_POLL: Duration = Duration::from_millis(500);
const BULK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const INTERRUPT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Endpoint set discovered at open time; immutable until close.
#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoints {
    pub interrupt_in: u8,
    pub interrupt_out: u8,
    pub bulk_out: u8,
    pub interrupt_in_mps: u16,
    pub interrupt_out_mps: u16,
    pub bulk_out_mps: u16,
}

struct OpenState {
    handle: Arc<DeviceHandle<Context>>,
    endpoints: Endpoints,
    pump: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

struct SessionInner {
    device: Device<Context>,
    usb_path: String,
    running: AtomicBool,
    shutdown: AtomicBool,
    close_lock: Mutex<()>,
    state: Mutex<Option<OpenState>>,
    sink: Mutex<Option<EventSink>>,
    queue: Mutex<VecDeque<LinkEvent>>,
    queue_cv: Condvar,
    worker_running: AtomicBool,
}

impl SessionInner {
    fn push_event(&self, event: LinkEvent) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(event);
        self.queue_cv.notify_one();
    }
}

/// One opened recovery-mode device.
pub struct UsbSession {
    inner: Arc<SessionInner>,
}

impl UsbSession {
    pub fn new(device: Device<Context>, usb_path: String) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                device,
                usb_path,
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                close_lock: Mutex::new(()),
                state: Mutex::new(None),
                sink: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                worker_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoints(&self) -> Option<Endpoints> {
        self.inner.state.lock().unwrap().as_ref().map(|s| s.endpoints)
    }

    #[instrument(level = "info", skip(self), fields(usb_path = %self.inner.usb_path))]
    fn open_handle(&self) -> Result<(Arc<DeviceHandle<Context>>, Endpoints), UsbError> {
        let inner = &self.inner;
        let handle = inner.device.open()?;

        if let Ok(descriptor) = inner.device.device_descriptor() {
            if let Ok(serial) = handle.read_serial_number_string_ascii(&descriptor) {
                info!(serial = %serial, "Device serial number");
            }
        }
        debug!(usb_path = %inner.usb_path, "Opening USB device");

        match handle.detach_kernel_driver(0) {
            Ok(()) => debug!("Detached kernel driver"),
            // A driver that is absent, or a platform that cannot detach,
            // is not an error for a device still settling.
            Err(rusb::Error::NotFound)
            | Err(rusb::Error::NotSupported)
            | Err(rusb::Error::InvalidParam) => {}
            Err(e) => {
                error!(error = %e, "Failed to detach kernel driver");
                return Err(e.into());
            }
        }

        let mut config = None;
        for attempt in 1..=CONFIG_DESCRIPTOR_ATTEMPTS {
            match inner.device.active_config_descriptor() {
                Ok(descriptor) if descriptor.num_interfaces() > 0 => {
                    config = Some(descriptor);
                    break;
                }
                Ok(_) => {
                    warn!(attempt, "Config descriptor reports zero interfaces");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to get config descriptor");
                }
            }
            if attempt < CONFIG_DESCRIPTOR_ATTEMPTS {
                std::thread::sleep(CONFIG_DESCRIPTOR_RETRY);
            }
        }
        let Some(config) = config else {
            warn!("Config descriptor never settled, resetting device");
            let _ = handle.reset();
            return Err(UsbError::TransientDeviceState);
        };

        handle.claim_interface(0)?;

        let mut endpoints = Endpoints::default();
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    match (endpoint.transfer_type(), endpoint.direction()) {
                        (TransferType::Interrupt, Direction::In) => {
                            if endpoints.interrupt_in == 0 {
                                endpoints.interrupt_in = endpoint.address();
                                endpoints.interrupt_in_mps = endpoint.max_packet_size();
                            }
                        }
                        (TransferType::Interrupt, Direction::Out) => {
                            if endpoints.interrupt_out == 0 {
                                endpoints.interrupt_out = endpoint.address();
                                endpoints.interrupt_out_mps = endpoint.max_packet_size();
                            }
                        }
                        (TransferType::Bulk, Direction::Out) => {
                            if endpoints.bulk_out == 0 {
                                endpoints.bulk_out = endpoint.address();
                                endpoints.bulk_out_mps = endpoint.max_packet_size();
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if endpoints.interrupt_in == 0 || endpoints.interrupt_in_mps == 0 {
            return Err(UsbError::EndpointMissing("interrupt IN"));
        }
        if endpoints.interrupt_out == 0 || endpoints.interrupt_out_mps == 0 {
            return Err(UsbError::EndpointMissing("interrupt OUT"));
        }
        if endpoints.bulk_out == 0 {
            return Err(UsbError::EndpointMissing("bulk OUT"));
        }

        for address in [
            endpoints.interrupt_in,
            endpoints.interrupt_out,
            endpoints.bulk_out,
        ] {
            handle.clear_halt(address)?;
        }

        info!(
            interrupt_in = %format_args!("0x{:02x}", endpoints.interrupt_in),
            interrupt_out = %format_args!("0x{:02x}", endpoints.interrupt_out),
            bulk_out = %format_args!("0x{:02x}", endpoints.bulk_out),
            "Device opened"
        );

        Ok((Arc::new(handle), endpoints))
    }

    /// The interrupt-IN transfer, continuously resubmitted until the device
    /// goes away or the session is closed.
    #[instrument(skip_all, fields(endpoint = endpoints.interrupt_in))]
    fn interrupt_pump(inner: Arc<SessionInner>, handle: Arc<DeviceHandle<Context>>, endpoints: Endpoints) {
        let mut buf = vec![0u8; endpoints.interrupt_in_mps as usize];

        while inner.running.load(Ordering::SeqCst) {
            match handle.read_interrupt(endpoints.interrupt_in, &mut buf, INTERRUPT_POLL) {
                Ok(n) => {
                    debug!(size = n, "Interrupt received");
                    inner.push_event(LinkEvent::Interrupt(buf[..n].to_vec()));
                }
                Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => {}
                Err(rusb::Error::NoDevice) => {
                    info!("Device is no longer there during transfer");
                    inner.running.store(false, Ordering::SeqCst);
                    inner.push_event(LinkEvent::NoDevice);
                    return;
                }
                Err(rusb::Error::Pipe) => {
                    warn!("Endpoint stalled, clearing halt");
                    match handle.clear_halt(endpoints.interrupt_in) {
                        Ok(()) => info!("Halt cleared, resubmitting transfer"),
                        Err(rusb::Error::NoDevice) => {
                            inner.running.store(false, Ordering::SeqCst);
                            inner.push_event(LinkEvent::NoDevice);
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to clear halt on endpoint");
                            inner.push_event(LinkEvent::TransferError);
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Interrupt transfer failed");
                    inner.push_event(LinkEvent::TransferError);
                    return;
                }
            }
        }

        // Stopped by close(): report the cancelled transfer so a pending
        // observer sees the same event the device callback would have fired.
        if inner.shutdown.load(Ordering::SeqCst) {
            inner.push_event(LinkEvent::TransferCancelled);
        }
    }

    /// Drains the callback queue FIFO and invokes the sink with no session
    /// lock held.
    fn callback_worker(inner: Arc<SessionInner>) {
        let sink = inner.sink.lock().unwrap().clone();
        let Some(sink) = sink else {
            return;
        };

        loop {
            let event = {
                let mut queue = inner.queue.lock().unwrap();
                loop {
                    if let Some(event) = queue.pop_front() {
                        break Some(event);
                    }
                    if !inner.worker_running.load(Ordering::SeqCst) {
                        break None;
                    }
                    queue = inner.queue_cv.wait(queue).unwrap();
                }
            };
            match event {
                Some(event) => sink(event),
                None => return,
            }
        }
    }
}

impl DeviceLink for UsbSession {
    #[instrument(level = "info", skip(self, sink), fields(usb_path = %self.inner.usb_path))]
    fn open(&self, sink: EventSink) -> Result<(), UsbError> {
        let inner = &self.inner;
        if inner.state.lock().unwrap().is_some() {
            return Ok(());
        }

        *inner.sink.lock().unwrap() = Some(sink);

        let (handle, endpoints) = self.open_handle()?;

        inner.running.store(true, Ordering::SeqCst);
        let pump = {
            let inner = self.inner.clone();
            let handle = handle.clone();
            std::thread::spawn(move || Self::interrupt_pump(inner, handle, endpoints))
        };

        *inner.state.lock().unwrap() = Some(OpenState {
            handle,
            endpoints,
            pump: Some(pump),
            worker: None,
        });

        Ok(())
    }

    fn enable_interrupts(&self) -> Result<(), UsbError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        let Some(state) = state.as_mut() else {
            return Err(UsbError::NotRunning);
        };
        if state.worker.is_some() {
            return Ok(());
        }

        inner.worker_running.store(true, Ordering::SeqCst);
        let worker = {
            let inner = self.inner.clone();
            std::thread::spawn(move || Self::callback_worker(inner))
        };
        state.worker = Some(worker);
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, UsbError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(UsbError::NotRunning);
        }

        let (handle, bulk_out) = {
            let state = inner.state.lock().unwrap();
            let Some(state) = state.as_ref() else {
                return Err(UsbError::NotRunning);
            };
            (state.handle.clone(), state.endpoints.bulk_out)
        };

        debug!(endpoint = bulk_out, size = data.len(), "Writing to USB device");

        let mut halt_cleared = false;
        loop {
            match handle.write_bulk(bulk_out, data, BULK_WRITE_TIMEOUT) {
                Ok(n) => {
                    debug!(bytes_written = n, "Write complete");
                    return Ok(n);
                }
                Err(rusb::Error::Pipe) if !halt_cleared => {
                    warn!("Endpoint halted, clearing halt");
                    match handle.clear_halt(bulk_out) {
                        Ok(()) => {
                            info!("Halt cleared, retrying transfer");
                            halt_cleared = true;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to clear halt on endpoint");
                            return Err(UsbError::EndpointHalted(e));
                        }
                    }
                }
                Err(rusb::Error::NoDevice) => {
                    error!("USB device is no longer available");
                    inner.running.store(false, Ordering::SeqCst);
                    return Err(UsbError::NoDevice);
                }
                Err(e) => {
                    error!(error = %e, "Failed to write to USB device");
                    return Err(UsbError::Transfer(e));
                }
            }
        }
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(UsbError::NotRunning);
        }

        let (handle, interrupt_out) = {
            let state = inner.state.lock().unwrap();
            let Some(state) = state.as_ref() else {
                return Err(UsbError::NotRunning);
            };
            (state.handle.clone(), state.endpoints.interrupt_out)
        };

        debug!(endpoint = interrupt_out, size = data.len(), "Sending interrupt out transfer");
        handle
            .write_interrupt(interrupt_out, data, INTERRUPT_WRITE_TIMEOUT)
            .map(|_| ())
            .map_err(UsbError::Transfer)
    }

    fn usb_path(&self) -> &str {
        &self.inner.usb_path
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let inner = &self.inner;
        let _guard = inner.close_lock.lock().unwrap();
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.running.store(false, Ordering::SeqCst);

        let state = inner.state.lock().unwrap().take();
        if let Some(mut state) = state {
            if let Some(pump) = state.pump.take() {
                let _ = pump.join();
            }

            inner.worker_running.store(false, Ordering::SeqCst);
            inner.queue_cv.notify_all();
            if let Some(worker) = state.worker.take() {
                let _ = worker.join();
            }

            let _ = state.handle.release_interface(0);
            debug!(usb_path = %inner.usb_path, "USB session closed");
        }
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        self.close();
    }
}
