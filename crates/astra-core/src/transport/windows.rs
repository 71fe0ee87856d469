//! Windows discovery.
//!
//! libusb has no hotplug support on Windows. An invisible message-only
//! window receives USB device-interface notifications; arrivals signal a
//! condition variable consumed by an enumeration worker, which walks the
//! libusb device list under the cross-process critical section. Enumeration
//! never happens on the window thread.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, UsbContext};
use tracing::{debug, error, info, warn};
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW, PostMessageW,
    RegisterClassW, RegisterDeviceNotificationW, TranslateMessage, DBT_DEVICEARRIVAL,
    DBT_DEVTYP_DEVICEINTERFACE, DEVICE_NOTIFY_WINDOW_HANDLE, DEV_BROADCAST_DEVICEINTERFACE_W,
    HWND_MESSAGE, MSG, WM_DEVICECHANGE, WM_QUIT, WNDCLASSW,
};

use super::lock::{CriticalSection, ACQUIRE_TIMEOUT};
use super::{
    usb_path, ClaimRegistry, DeviceAddedCallback, DiscoveredDevice, PortFilter, Transport,
    TransportError,
};

const GUID_DEVINTERFACE_USB_DEVICE: GUID = GUID {
    data1: 0xA5DCBF10,
    data2: 0x6530,
    data3: 0x11D2,
    data4: [0x90, 0x1F, 0x00, 0xC0, 0x4F, 0xB9, 0x51, 0xED],
};

const WINDOW_CLASS: &str = "AstraDeviceManager";
/// Descriptors are not always readable the instant the arrival fires.
const SETTLE_DELAY: Duration = Duration::from_millis(50);
const ENUMERATION_ATTEMPTS: u32 = 3;
const ARRIVAL_POLL: Duration = Duration::from_millis(500);

struct ArrivalSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl ArrivalSignal {
    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cv.notify_one();
    }

    /// Wait for the next arrival; false on timeout.
    fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (guard, _) = self.cv.wait_timeout(pending, timeout).unwrap();
            pending = guard;
        }
        std::mem::take(&mut *pending)
    }
}

// The window procedure has no user-data channel that survives
// RegisterClassW, so the signal is process-global.
static ARRIVAL: OnceLock<Arc<ArrivalSignal>> = OnceLock::new();

extern "system" fn wnd_proc(hwnd: HWND, message: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if message == WM_DEVICECHANGE && wparam as u32 == DBT_DEVICEARRIVAL {
        if let Some(signal) = ARRIVAL.get() {
            signal.notify();
        }
    }
    unsafe { DefWindowProcW(hwnd, message, wparam, lparam) }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Message-window + enumeration-worker transport.
pub struct WinTransport {
    context: Context,
    filter: PortFilter,
    claims: Arc<ClaimRegistry>,
    critical: Arc<CriticalSection>,
    running: Arc<AtomicBool>,
    hwnd: Arc<AtomicIsize>,
    window_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl WinTransport {
    pub fn new(
        filter: PortFilter,
        claims: Arc<ClaimRegistry>,
        usb_debug: bool,
    ) -> Result<Self, TransportError> {
        let mut context = Context::new().map_err(TransportError::Init)?;
        if usb_debug {
            context.set_log_level(rusb::LogLevel::Debug);
        }
        Ok(Self {
            context,
            filter,
            claims,
            critical: Arc::new(CriticalSection::new()?),
            running: Arc::new(AtomicBool::new(false)),
            hwnd: Arc::new(AtomicIsize::new(0)),
            window_thread: None,
            worker_thread: None,
        })
    }

    fn run_window(hwnd_out: Arc<AtomicIsize>) {
        unsafe {
            let class_name = wide(WINDOW_CLASS);
            let instance = GetModuleHandleW(std::ptr::null());

            let mut wc: WNDCLASSW = std::mem::zeroed();
            wc.lpfnWndProc = Some(wnd_proc);
            wc.hInstance = instance;
            wc.lpszClassName = class_name.as_ptr();
            if RegisterClassW(&wc) == 0 {
                error!(error = ?std::io::Error::last_os_error(), "Failed to register window class");
                return;
            }

            let hwnd = CreateWindowExW(
                0,
                class_name.as_ptr(),
                class_name.as_ptr(),
                0,
                0,
                0,
                0,
                0,
                HWND_MESSAGE,
                std::ptr::null_mut(),
                instance,
                std::ptr::null(),
            );
            if hwnd.is_null() {
                error!(error = ?std::io::Error::last_os_error(), "Failed to create message window");
                return;
            }
            hwnd_out.store(hwnd as isize, Ordering::SeqCst);

            let mut dbi: DEV_BROADCAST_DEVICEINTERFACE_W = std::mem::zeroed();
            dbi.dbcc_size = std::mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32;
            dbi.dbcc_devicetype = DBT_DEVTYP_DEVICEINTERFACE;
            dbi.dbcc_classguid = GUID_DEVINTERFACE_USB_DEVICE;

            let notify = RegisterDeviceNotificationW(
                hwnd as _,
                &dbi as *const _ as *const core::ffi::c_void,
                DEVICE_NOTIFY_WINDOW_HANDLE,
            );
            if notify.is_null() {
                error!(error = ?std::io::Error::last_os_error(), "Failed to register device notification");
                return;
            }

            let mut msg: MSG = std::mem::zeroed();
            while GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) > 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker(
        context: Context,
        filter: PortFilter,
        claims: Arc<ClaimRegistry>,
        critical: Arc<CriticalSection>,
        running: Arc<AtomicBool>,
        vendor_id: u16,
        product_id: u16,
        callback: DeviceAddedCallback,
    ) {
        let Some(signal) = ARRIVAL.get().cloned() else {
            return;
        };

        while running.load(Ordering::SeqCst) {
            if !signal.wait(ARRIVAL_POLL) {
                continue;
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }

            if critical.acquire(ACQUIRE_TIMEOUT).is_err() {
                // Another process owns the window; the next arrival retries.
                continue;
            }
            std::thread::sleep(SETTLE_DELAY);
            Self::enumerate(
                &context, &filter, &claims, vendor_id, product_id, &callback,
            );
            critical.release();
        }
    }

    fn enumerate(
        context: &Context,
        filter: &PortFilter,
        claims: &ClaimRegistry,
        vendor_id: u16,
        product_id: u16,
        callback: &DeviceAddedCallback,
    ) {
        for attempt in 1..=ENUMERATION_ATTEMPTS {
            let devices = match context.devices() {
                Ok(devices) => devices,
                Err(e) => {
                    error!(error = %e, "Failed to get device list");
                    return;
                }
            };

            let mut retry = false;
            for device in devices.iter() {
                let descriptor = match device.device_descriptor() {
                    Ok(descriptor) => descriptor,
                    Err(_) => continue,
                };
                if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                    continue;
                }

                let path = usb_path(&device);
                if !filter.matches(&path) {
                    debug!(usb_path = %path, "Device is not on a monitored port");
                    continue;
                }
                if claims.is_claimed(&path) {
                    debug!(usb_path = %path, "Device already has a session");
                    continue;
                }

                // DBT_DEVICEARRIVAL fires for every USB device, including
                // ones this process already holds open. A probe open sorts
                // the strangers from our own.
                match device.open() {
                    Ok(probe) => {
                        drop(probe);
                        info!(usb_path = %path, "Device arrived");
                        callback(DiscoveredDevice {
                            device,
                            usb_path: path,
                        });
                    }
                    Err(rusb::Error::Access) => {
                        debug!(usb_path = %path, "Open reported access denied, skipping");
                    }
                    Err(rusb::Error::NoDevice) | Err(rusb::Error::NotSupported) => {
                        // Gone mid-enumeration; rescan.
                        retry = true;
                        break;
                    }
                    Err(e) => {
                        debug!(usb_path = %path, error = %e, "Failed to probe device");
                    }
                }
            }

            if !retry {
                return;
            }
            warn!(attempt, "Device list changed mid-enumeration, rescanning");
            std::thread::sleep(SETTLE_DELAY);
        }
    }
}

impl Transport for WinTransport {
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        callback: DeviceAddedCallback,
    ) -> Result<(), TransportError> {
        ARRIVAL.get_or_init(|| {
            Arc::new(ArrivalSignal {
                pending: Mutex::new(false),
                cv: Condvar::new(),
            })
        });

        self.running.store(true, Ordering::SeqCst);

        let hwnd = self.hwnd.clone();
        self.window_thread = Some(std::thread::spawn(move || Self::run_window(hwnd)));

        let context = self.context.clone();
        let filter = self.filter.clone();
        let claims = self.claims.clone();
        let critical = self.critical.clone();
        let running = self.running.clone();
        self.worker_thread = Some(std::thread::spawn(move || {
            Self::run_worker(
                context, filter, claims, critical, running, vendor_id, product_id, callback,
            )
        }));

        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let hwnd = self.hwnd.swap(0, Ordering::SeqCst);
        if hwnd != 0 {
            unsafe {
                PostMessageW(hwnd as HWND, WM_QUIT, 0, 0);
            }
        }
        if let Some(window) = self.window_thread.take() {
            let _ = window.join();
        }
        if hwnd != 0 {
            unsafe {
                DestroyWindow(hwnd as HWND);
            }
        }

        if let Some(signal) = ARRIVAL.get() {
            signal.notify();
        }
        if let Some(worker) = self.worker_thread.take() {
            let _ = worker.join();
        }
        debug!("Windows transport shut down");
    }

    fn block_enumeration(&self) -> Result<(), TransportError> {
        self.critical.acquire(ACQUIRE_TIMEOUT)
    }

    fn unblock_enumeration(&self) {
        self.critical.release();
    }
}

impl Drop for WinTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
