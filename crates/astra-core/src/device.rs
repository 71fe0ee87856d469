//! Per-device orchestration: boot, update, and completion over the
//! request-driven image transfer protocol.
//!
//! The device drives everything. It posts image requests on the interrupt
//! endpoint; the request worker looks each one up in the session catalog
//! and streams the framed payload over bulk-OUT. The orchestrator decides
//! when boot or update is logically complete and tears the session down
//! against concurrent disconnects and shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tracing::{debug, error, info, warn};

use crate::boot_image::{BootImage, UbootConsole, UENV_IMAGE};
use crate::console::Console;
use crate::events::{DeviceStatus, DeviceUpdate, Event, EventObserver};
use crate::flash_image::FlashImage;
use crate::image::{Image, ImageKind};
use crate::protocol::{self, InterruptPayload};
use crate::usb::{DeviceLink, EventSink, LinkEvent};

/// Synthesized image whose contents are the device's USB path.
pub const USB_PATH_IMAGE: &str = "06_IMAGE";
/// Synthesized image carrying the size of the previously sent payload.
pub const SIZE_REPLY_IMAGE: &str = "07_IMAGE";

/// Loading this image resets the device's USB subsystem; the disconnect
/// that follows is expected, not a failure.
const MINILOADER_RESET_IMAGE: &str = "gen3_miniloader.bin.usb";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BOOT_TIMEOUT_MESSAGE: &str =
    "Timeout during boot, press RESET while holding USB_BOOT to try again";

struct PhaseConfig {
    uboot_console: UbootConsole,
    uenv_support: bool,
    final_boot_image: String,
    final_update_image: String,
    reset_when_complete: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            uboot_console: UbootConsole::Uart,
            uenv_support: false,
            final_boot_image: String::new(),
            final_update_image: String::new(),
            reset_when_complete: false,
        }
    }
}

#[derive(Default)]
struct RequestState {
    ready: bool,
    image_type: u8,
    name: String,
}

struct DeviceShared {
    observer: Arc<dyn EventObserver>,
    device_name: String,
    boot_only: bool,
    boot_command: String,
    request_timeout: Duration,
    size_reply_path: PathBuf,
    running: AtomicBool,
    status: Mutex<DeviceStatus>,
    images: Mutex<Vec<Image>>,
    config: Mutex<PhaseConfig>,
    console: Mutex<Option<Arc<Console>>>,
    request: Mutex<RequestState>,
    request_cv: Condvar,
    worker_ready: Mutex<bool>,
    worker_ready_cv: Condvar,
    device_event: Mutex<()>,
    device_event_cv: Condvar,
    last_requested: Mutex<String>,
}

/// One Astra device being booted (and optionally updated).
pub struct AstraDevice<L: DeviceLink + 'static> {
    link: Arc<L>,
    shared: Arc<DeviceShared>,
    device_dir: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    close_lock: Mutex<()>,
}

impl<L: DeviceLink + 'static> AstraDevice<L> {
    pub fn new(
        link: Arc<L>,
        observer: Arc<dyn EventObserver>,
        temp_dir: &std::path::Path,
        boot_only: bool,
        boot_command: &str,
    ) -> Self {
        let device_name = format!("device:{}", link.usb_path());
        let dir_name: String = device_name
            .chars()
            .filter(|c| *c != ':')
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        let device_dir = temp_dir.join(dir_name);
        let size_reply_path = device_dir.join(SIZE_REPLY_IMAGE);

        Self {
            link,
            shared: Arc::new(DeviceShared {
                observer,
                device_name,
                boot_only,
                boot_command: boot_command.to_string(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                size_reply_path,
                running: AtomicBool::new(false),
                status: Mutex::new(DeviceStatus::Added),
                images: Mutex::new(Vec::new()),
                config: Mutex::new(PhaseConfig::default()),
                console: Mutex::new(None),
                request: Mutex::new(RequestState::default()),
                request_cv: Condvar::new(),
                worker_ready: Mutex::new(false),
                worker_ready_cv: Condvar::new(),
                device_event: Mutex::new(()),
                device_event_cv: Condvar::new(),
                last_requested: Mutex::new(String::new()),
            }),
            device_dir,
            worker: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn set_request_timeout(&mut self, timeout: Duration) {
        Arc::get_mut(&mut self.shared)
            .expect("session already started")
            .request_timeout = timeout;
    }

    pub fn device_name(&self) -> &str {
        &self.shared.device_name
    }

    pub fn status(&self) -> DeviceStatus {
        *self.shared.status.lock().unwrap()
    }

    /// Open the session, assemble the image catalog, and start serving
    /// boot images.
    pub fn boot(&self, boot_image: &BootImage) -> Result<()> {
        {
            let mut config = self.shared.config.lock().unwrap();
            config.uboot_console = boot_image.uboot_console;
            config.uenv_support = boot_image.uenv_support;
            config.final_boot_image = boot_image.final_boot_image.clone();
        }

        let sink: EventSink = {
            let shared = self.shared.clone();
            Arc::new(move |event| handle_usb_event(&shared, event))
        };
        self.link.open(sink)?;

        info!(device = %self.shared.device_name, "Device opened");
        std::fs::create_dir_all(&self.device_dir)
            .with_context(|| format!("creating {}", self.device_dir.display()))?;
        *self.shared.console.lock().unwrap() = Some(Arc::new(Console::new(&self.device_dir)?));

        self.set_status(DeviceStatus::Opened);
        send_status(&self.shared, DeviceStatus::Opened, 0.0, "", "");

        std::fs::write(self.device_dir.join(USB_PATH_IMAGE), self.link.usb_path())?;

        {
            let mut images = self.shared.images.lock().unwrap();
            images.extend(boot_image.images.iter().cloned());

            // If uEnv.txt is not in the image list and uEnv is supported,
            // synthesize one in the device directory from the boot command.
            if boot_image.uenv_support && !images.iter().any(|i| i.name() == UENV_IMAGE) {
                debug!("Adding uEnv.txt to image list");
                if self.shared.boot_command.is_empty() {
                    // With no command to run, booting is complete once
                    // uEnv.txt is delivered, even if more boot images exist.
                    self.shared.config.lock().unwrap().final_boot_image = UENV_IMAGE.to_string();
                }
                std::fs::write(
                    self.device_dir.join(UENV_IMAGE),
                    format!("bootcmd={}", self.shared.boot_command),
                )?;
                images.push(Image::new(self.device_dir.join(UENV_IMAGE), ImageKind::Boot));
            }

            images.push(Image::new(
                self.device_dir.join(USB_PATH_IMAGE),
                ImageKind::Boot,
            ));
            std::fs::File::create(&self.shared.size_reply_path)?;
            images.push(Image::new(
                self.shared.size_reply_path.clone(),
                ImageKind::UpdateEmmc,
            ));
        }

        if !self.shared.boot_only && boot_image.linux_boot {
            // The kernel and initramfs are booted, not flashed; delivering
            // the environment is the last thing the host does.
            self.shared.config.lock().unwrap().final_boot_image = UENV_IMAGE.to_string();
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.set_status(DeviceStatus::BootStart);
        send_status(&self.shared, DeviceStatus::BootStart, 0.0, "", "");

        let worker = {
            let shared = self.shared.clone();
            let link = self.link.clone();
            std::thread::spawn(move || run_request_worker(shared, link))
        };
        *self.worker.lock().unwrap() = Some(worker);

        {
            debug!("Waiting for image request worker to be ready");
            let mut ready = self.shared.worker_ready.lock().unwrap();
            while !*ready {
                ready = self.shared.worker_ready_cv.wait(ready).unwrap();
            }
        }

        self.link.enable_interrupts()?;
        Ok(())
    }

    /// Arm the update phase. Called after a successful `boot`.
    pub fn update(&self, flash_image: &FlashImage) -> Result<()> {
        {
            let mut config = self.shared.config.lock().unwrap();
            config.final_update_image = flash_image.final_image.clone();
            config.reset_when_complete = flash_image.reset_when_complete;
        }
        {
            let mut images = self.shared.images.lock().unwrap();
            images.extend(flash_image.images.iter().cloned());
        }

        let (uenv_support, console_kind) = {
            let config = self.shared.config.lock().unwrap();
            (config.uenv_support, config.uboot_console)
        };

        // Without uEnv support the flash command has to be typed at the
        // U-Boot prompt; with it (or with a UART console) the device
        // already knows what to do.
        if !uenv_support && console_kind == UbootConsole::Usb {
            let console = self.console()?;
            if console.wait_for_prompt() {
                self.send_to_console(&format!("{}\n", flash_image.flash_command))?;
            }
        }

        Ok(())
    }

    /// Block until the device finishes (resets or returns to the U-Boot
    /// prompt) and emit the final completion status.
    pub fn wait_for_completion(&self) -> Result<()> {
        let (uenv_support, console_kind, reset_when_complete) = {
            let config = self.shared.config.lock().unwrap();
            (
                config.uenv_support,
                config.uboot_console,
                config.reset_when_complete,
            )
        };

        if uenv_support || console_kind == UbootConsole::Uart {
            let mut reported = false;
            loop {
                {
                    let guard = self.shared.device_event.lock().unwrap();
                    if self.shared.running.load(Ordering::SeqCst) {
                        let _guard = self.shared.device_event_cv.wait(guard).unwrap();
                    }
                }

                let status = self.status();
                if !reported {
                    if self.shared.boot_only && status == DeviceStatus::BootComplete {
                        // Device reset after boot.
                        send_status(&self.shared, status, 100.0, "", "Success");
                        reported = true;
                    } else if !self.shared.boot_only && status == DeviceStatus::UpdateComplete {
                        // Device reset after update.
                        send_status(&self.shared, status, 100.0, "", "Success");
                        reported = true;
                    }
                }

                if !self.shared.running.load(Ordering::SeqCst) {
                    debug!("Device event received: shutting down");
                    break;
                }
            }
        } else {
            let console = self.console()?;
            if console.wait_for_prompt() {
                if reset_when_complete {
                    self.send_to_console("reset\n")?;
                }
                // The update itself needs no reset; the console being back
                // at the prompt means the flash command finished.
                if self.status() == DeviceStatus::UpdateComplete {
                    send_status(
                        &self.shared,
                        DeviceStatus::UpdateComplete,
                        100.0,
                        "",
                        "Success",
                    );
                }
            }
        }

        Ok(())
    }

    /// Raw keystrokes to the U-Boot console.
    pub fn send_to_console(&self, data: &str) -> Result<()> {
        self.link
            .write_interrupt(data.as_bytes())
            .context("failed to send data to console")
    }

    /// Everything the console has received so far.
    pub fn receive_from_console(&self) -> Result<String> {
        Ok(self.console()?.contents())
    }

    /// Tear the session down: stop and join the request worker, shut the
    /// console down, close the USB session. Idempotent.
    pub fn close(&self) {
        let _guard = self.close_lock.lock().unwrap();
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        notify_device_event(&self.shared);
        self.shared.request_cv.notify_all();

        if let Some(worker) = self.worker.lock().unwrap().take() {
            debug!("Joining image request worker");
            let _ = worker.join();
        }

        debug!("Shutting down console");
        if let Some(console) = self.shared.console.lock().unwrap().clone() {
            console.shutdown();
        }

        self.shared.images.lock().unwrap().clear();

        debug!("Closing USB session");
        self.link.close();
        debug!("Close complete");
    }

    fn console(&self) -> Result<Arc<Console>> {
        self.shared
            .console
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("console not available before boot"))
    }

    fn set_status(&self, status: DeviceStatus) {
        *self.shared.status.lock().unwrap() = status;
    }
}

impl<L: DeviceLink + 'static> Drop for AstraDevice<L> {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_status(
    shared: &DeviceShared,
    status: DeviceStatus,
    progress: f64,
    image: &str,
    message: &str,
) {
    // The size-reply exchange is protocol plumbing, not user progress.
    if image == SIZE_REPLY_IMAGE {
        return;
    }
    info!(
        device = %shared.device_name,
        status = %status,
        progress,
        image = %image,
        message = %message,
        "Device status"
    );
    shared.observer.on_event(&Event::Device(DeviceUpdate {
        device: shared.device_name.clone(),
        status,
        progress,
        image: image.to_string(),
        message: message.to_string(),
    }));
}

fn notify_device_event(shared: &DeviceShared) {
    let _guard = shared.device_event.lock().unwrap();
    shared.device_event_cv.notify_all();
}

fn end_session(shared: &DeviceShared) {
    shared.running.store(false, Ordering::SeqCst);
    notify_device_event(shared);
}

/// USB event handler, invoked from the link's callback worker.
fn handle_usb_event(shared: &Arc<DeviceShared>, event: LinkEvent) {
    match event {
        LinkEvent::Interrupt(bytes) => handle_interrupt(shared, &bytes),
        LinkEvent::NoDevice | LinkEvent::TransferCancelled | LinkEvent::TransferError => {
            let last_requested = shared.last_requested.lock().unwrap().clone();
            if last_requested == MINILOADER_RESET_IMAGE {
                // The miniloader resets the USB subsystem and the device
                // reconnects; the transport will rediscover it.
                warn!(
                    device = %shared.device_name,
                    "Device disconnected after sending {MINILOADER_RESET_IMAGE}"
                );
            } else {
                debug!("Device disconnected: shutting down");
                let status = {
                    let mut status = shared.status.lock().unwrap();
                    match *status {
                        DeviceStatus::UpdateProgress => *status = DeviceStatus::UpdateFail,
                        DeviceStatus::BootProgress => *status = DeviceStatus::BootFail,
                        _ => {}
                    }
                    *status
                };
                // A disconnect in a complete state is just the device
                // rebooting; wait_for_completion reports the success.
                if !status.is_complete() {
                    send_status(shared, status, 0.0, "", "Device disconnected");
                }
            }
            shared.running.store(false, Ordering::SeqCst);
            notify_device_event(shared);
            shared.request_cv.notify_all();
        }
    }
}

fn handle_interrupt(shared: &Arc<DeviceShared>, bytes: &[u8]) {
    match protocol::parse_interrupt(bytes) {
        InterruptPayload::Request(request) => {
            debug!(
                image_type = %format_args!("0x{:02x}", request.image_type),
                name = %request.name,
                prefix = request.prefix.as_deref().unwrap_or(""),
                "Image request"
            );

            let became_update_start = {
                let mut status = shared.status.lock().unwrap();
                if *status == DeviceStatus::BootComplete && !shared.boot_only {
                    *status = DeviceStatus::UpdateStart;
                    true
                } else {
                    false
                }
            };
            if became_update_start {
                send_status(shared, DeviceStatus::UpdateStart, 0.0, "", "");
            }

            *shared.last_requested.lock().unwrap() = request.name.clone();
            {
                let mut pending = shared.request.lock().unwrap();
                pending.ready = true;
                pending.image_type = request.image_type;
                pending.name = request.name;
            }
            shared.request_cv.notify_one();
        }
        InterruptPayload::Console(text) => {
            let console = shared.console.lock().unwrap().clone();
            if let Some(console) = console {
                console.append(&text);
            }
        }
    }
}

/// The image-request worker: waits for requests, serves them, and applies
/// the terminal-image rules.
fn run_request_worker<L: DeviceLink>(shared: Arc<DeviceShared>, link: Arc<L>) {
    {
        let mut ready = shared.worker_ready.lock().unwrap();
        *ready = true;
        shared.worker_ready_cv.notify_all();
    }

    let mut wait_for_size_reply = false;
    let mut block = vec![0u8; protocol::BLOCK_SIZE];
    let mut image_count = 0u32;

    loop {
        let request = {
            let guard = shared.request.lock().unwrap();
            let (mut guard, timeout) = shared
                .request_cv
                .wait_timeout_while(guard, shared.request_timeout, |pending| {
                    !pending.ready && shared.running.load(Ordering::SeqCst)
                })
                .unwrap();

            if !shared.running.load(Ordering::SeqCst) {
                debug!("Image request worker stopping");
                return;
            }
            if timeout.timed_out() && !guard.ready {
                None
            } else {
                guard.ready = false;
                Some((guard.image_type, guard.name.clone()))
            }
        };

        let Some((image_type, name)) = request else {
            debug!("Timeout waiting for image request");
            let status = *shared.status.lock().unwrap();
            match status {
                DeviceStatus::BootProgress => {
                    *shared.status.lock().unwrap() = DeviceStatus::BootFail;
                    send_status(
                        &shared,
                        DeviceStatus::BootFail,
                        0.0,
                        "",
                        BOOT_TIMEOUT_MESSAGE,
                    );
                    end_session(&shared);
                    return;
                }
                DeviceStatus::UpdateProgress => {
                    // The device may be busy flashing; report the stall but
                    // keep waiting.
                    send_status(
                        &shared,
                        DeviceStatus::UpdateProgress,
                        0.0,
                        "",
                        "Stalled: no image request received",
                    );
                }
                _ => {}
            }
            continue;
        };

        let images = shared.images.lock().unwrap();
        let Some(image) = images.iter().find(|i| i.name() == name) else {
            drop(images);
            error!(image = %name, "Requested image not found");
            let status = *shared.status.lock().unwrap();
            let failed = match status {
                DeviceStatus::BootStart | DeviceStatus::BootProgress => {
                    Some(DeviceStatus::BootFail)
                }
                DeviceStatus::UpdateStart | DeviceStatus::UpdateProgress => {
                    Some(DeviceStatus::UpdateFail)
                }
                _ => {
                    warn!(image = %name, status = %status, "Image requested in unexpected state");
                    None
                }
            };
            if let Some(failed) = failed {
                *shared.status.lock().unwrap() = failed;
                send_status(
                    &shared,
                    failed,
                    0.0,
                    &name,
                    &format!("{name} image not found"),
                );
            }
            end_session(&shared);
            return;
        };

        let armed = {
            let mut status = shared.status.lock().unwrap();
            match *status {
                DeviceStatus::BootStart => {
                    *status = DeviceStatus::BootProgress;
                    Some(DeviceStatus::BootProgress)
                }
                DeviceStatus::UpdateStart => {
                    *status = DeviceStatus::UpdateProgress;
                    Some(DeviceStatus::UpdateProgress)
                }
                _ => None,
            }
        };
        if let Some(armed) = armed {
            send_status(&shared, armed, 0.0, "", "");
        }

        let kind = image.kind();
        let result = send_image(&shared, link.as_ref(), image, image_type, &mut block);
        drop(images);

        match result {
            Err(e) => {
                error!(error = %e, image = %name, "Failed to send image");
                send_status(
                    &shared,
                    DeviceStatus::ImageSendFail,
                    0.0,
                    &name,
                    "Failed to send image",
                );
                let failed = {
                    let mut status = shared.status.lock().unwrap();
                    match *status {
                        DeviceStatus::BootStart | DeviceStatus::BootProgress => {
                            *status = DeviceStatus::BootFail
                        }
                        DeviceStatus::UpdateStart | DeviceStatus::UpdateProgress => {
                            *status = DeviceStatus::UpdateFail
                        }
                        _ => {}
                    }
                    *status
                };
                if failed.is_failure() {
                    send_status(&shared, failed, 0.0, &name, "Failed to send image");
                }
                end_session(&shared);
                return;
            }
            Ok(()) => {
                let (final_boot, final_update) = {
                    let config = shared.config.lock().unwrap();
                    (
                        config.final_boot_image.clone(),
                        config.final_update_image.clone(),
                    )
                };
                debug!(
                    image = %name,
                    final_boot = %final_boot,
                    final_update = %final_update,
                    "Image sent successfully"
                );

                if !final_boot.is_empty() && name.contains(final_boot.as_str()) {
                    debug!("Final boot image sent");
                    if !shared.boot_only {
                        *shared.status.lock().unwrap() = DeviceStatus::BootComplete;
                        send_status(&shared, DeviceStatus::BootComplete, 100.0, "", "Success");
                    } else {
                        // Boot-only sessions still get one size ping before
                        // the device moves on.
                        wait_for_size_reply = true;
                    }
                } else if !final_update.is_empty() && name.contains(final_update.as_str()) {
                    debug!("Final update image sent");
                    if matches!(kind, ImageKind::UpdateEmmc | ImageKind::UpdateSpi) {
                        // The device asks for the size of the image it just
                        // received before the update is really over.
                        wait_for_size_reply = true;
                    } else {
                        *shared.status.lock().unwrap() = DeviceStatus::UpdateComplete;
                    }
                } else if wait_for_size_reply && name == SIZE_REPLY_IMAGE {
                    debug!("Size reply image sent");
                    let done = if shared.boot_only {
                        DeviceStatus::BootComplete
                    } else {
                        DeviceStatus::UpdateComplete
                    };
                    *shared.status.lock().unwrap() = done;
                    wait_for_size_reply = false;
                }

                image_count += 1;
                debug!(image_count, "Image count");
            }
        }
    }
}

/// Stream one image: 8-byte header, then blocks of up to
/// [`protocol::BLOCK_SIZE`] bytes. Total bytes on the wire equal
/// `size + 8`.
fn send_image<L: DeviceLink + ?Sized>(
    shared: &DeviceShared,
    link: &L,
    image: &Image,
    image_type: u8,
    block: &mut [u8],
) -> Result<()> {
    let mut reader = image.open()?;

    send_status(shared, DeviceStatus::ImageSendStart, 0.0, image.name(), "");

    let total = reader.size() + protocol::REPLY_HEADER_SIZE as u64;
    let header = protocol::encode_reply_header(reader.size() as u32);
    let mut transferred = link.write(&header)? as u64;
    send_status(
        shared,
        DeviceStatus::ImageSendProgress,
        percent(transferred, total),
        image.name(),
        "",
    );

    debug!(total, "Total transfer size");
    while transferred < total {
        let n = reader.read_block(block)?;
        if n == 0 {
            anyhow::bail!("image truncated after {transferred} of {total} bytes");
        }
        transferred += link.write(&block[..n])? as u64;
        send_status(
            shared,
            DeviceStatus::ImageSendProgress,
            percent(transferred, total),
            image.name(),
            "",
        );
    }

    if image_type > protocol::SIZE_REPLY_THRESHOLD {
        let size = reader.size() as u32;
        debug!(size, "Writing image size to {SIZE_REPLY_IMAGE}");
        if let Err(e) = std::fs::write(&shared.size_reply_path, size.to_le_bytes()) {
            error!(error = %e, "Failed to update size reply file");
        }
    }

    send_status(
        shared,
        DeviceStatus::ImageSendComplete,
        100.0,
        image.name(),
        "",
    );
    Ok(())
}

fn percent(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (transferred as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_image::{MemoryLayout, SecureBootVersion, UbootVariant};
    use crate::flash_image::FlashKind;
    use crate::protocol::IMAGE_REQUEST_MAGIC;
    use crate::usb::MockLink;
    use std::path::Path;
    use std::time::Instant;

    struct Recorder {
        events: Mutex<Vec<DeviceUpdate>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn statuses(&self) -> Vec<DeviceStatus> {
            self.events.lock().unwrap().iter().map(|e| e.status).collect()
        }

        fn phase_statuses(&self) -> Vec<DeviceStatus> {
            self.statuses()
                .into_iter()
                .filter(|s| {
                    !matches!(
                        s,
                        DeviceStatus::ImageSendStart
                            | DeviceStatus::ImageSendProgress
                            | DeviceStatus::ImageSendComplete
                    )
                })
                .collect()
        }

        fn last_message_for(&self, status: DeviceStatus) -> Option<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| e.status == status)
                .map(|e| e.message.clone())
        }

        fn has_send_complete(&self, image: &str) -> bool {
            self.events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.status == DeviceStatus::ImageSendComplete && e.image == image)
        }
    }

    impl EventObserver for Recorder {
        fn on_event(&self, event: &Event) {
            if let Event::Device(update) = event {
                self.events.lock().unwrap().push(update.clone());
            }
        }
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn request_packet(image_type: u8, name: &str) -> Vec<u8> {
        let mut pkt = IMAGE_REQUEST_MAGIC.to_vec();
        pkt.push(image_type);
        pkt.extend_from_slice(name.as_bytes());
        pkt.resize(64, 0);
        pkt
    }

    fn write_images(dir: &Path, files: &[(&str, &[u8])], kind: ImageKind) -> Vec<Image> {
        std::fs::create_dir_all(dir).unwrap();
        files
            .iter()
            .map(|(name, contents)| {
                let path = dir.join(name);
                std::fs::write(&path, contents).unwrap();
                Image::new(path, kind)
            })
            .collect()
    }

    fn boot_image(
        images: Vec<Image>,
        uenv_support: bool,
        console: UbootConsole,
        final_boot_image: &str,
        linux_boot: bool,
    ) -> BootImage {
        BootImage {
            id: "test".to_string(),
            chip: "sl1680".to_string(),
            board: "rdk".to_string(),
            vendor_id: 0x06CB,
            product_id: 0x00B1,
            secure_boot: SecureBootVersion::V3,
            memory_layout: MemoryLayout::FourGb,
            uboot_console: console,
            uboot_variant: UbootVariant::Vendor,
            uenv_support,
            linux_boot,
            final_boot_image: final_boot_image.to_string(),
            images,
        }
    }

    fn flash_image(images: Vec<Image>, kind: FlashKind, final_image: &str) -> FlashImage {
        FlashImage {
            kind,
            boot_image_id: None,
            chip: "sl1680".to_string(),
            board: "rdk".to_string(),
            secure_boot: SecureBootVersion::V3,
            memory_layout: MemoryLayout::FourGb,
            images,
            flash_command: "l2emmc SYNAIMG; sleep 1; reset".to_string(),
            final_image: final_image.to_string(),
            reset_when_complete: true,
        }
    }

    fn scratch_dir() -> PathBuf {
        crate::boot_image::tests::scratch_dir("astra-device-test")
    }

    #[test]
    fn emmc_update_happy_path() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[("gen3_uboot.bin.usb", b"uboot payload".as_slice())],
            ImageKind::Boot,
        );
        let list_contents = b"boot.subimg,0x1000\n".as_slice();
        let flash_files = write_images(
            &temp.join("flash-src"),
            &[
                ("boot.subimg", b"partition contents".as_slice()),
                ("emmc_image_list", list_contents),
            ],
            ImageKind::UpdateEmmc,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("1-2.3"));
        let device = Arc::new(AstraDevice::new(
            link.clone(),
            recorder.clone(),
            &temp,
            false,
            "l2emmc SYNAIMG; sleep 1; reset",
        ));

        let boot = boot_image(boot_files, true, UbootConsole::Uart, UENV_IMAGE, false);
        device.boot(&boot).unwrap();

        link.push_interrupt(&request_packet(0x00, "gen3_uboot.bin.usb"));
        wait_until(|| recorder.has_send_complete("gen3_uboot.bin.usb"));
        link.push_interrupt(&request_packet(0x00, UENV_IMAGE));
        wait_until(|| device.status() == DeviceStatus::BootComplete);

        // Full frame on the wire: header then payload, size + 8 bytes.
        let writes = link.writes();
        assert_eq!(writes[0], protocol::encode_reply_header(13));
        assert_eq!(writes[1], b"uboot payload");

        let flash = flash_image(flash_files, FlashKind::Emmc, "boot.subimg");
        device.update(&flash).unwrap();

        link.push_interrupt(&request_packet(0x00, "boot.subimg"));
        wait_until(|| recorder.has_send_complete("boot.subimg"));
        link.push_interrupt(&request_packet(0x80, "emmc_image_list"));
        wait_until(|| recorder.has_send_complete("emmc_image_list"));
        link.push_interrupt(&request_packet(0x00, SIZE_REPLY_IMAGE));
        wait_until(|| device.status() == DeviceStatus::UpdateComplete);

        // The size reply carries the length of the 0x80-typed payload.
        let size_reply = std::fs::read(device.shared.size_reply_path.clone()).unwrap();
        assert_eq!(size_reply, (list_contents.len() as u32).to_le_bytes());

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_for_completion())
        };
        link.disconnect();
        waiter.join().unwrap().unwrap();

        assert_eq!(
            recorder.phase_statuses(),
            vec![
                DeviceStatus::Opened,
                DeviceStatus::BootStart,
                DeviceStatus::BootProgress,
                DeviceStatus::BootComplete,
                DeviceStatus::UpdateStart,
                DeviceStatus::UpdateProgress,
                DeviceStatus::UpdateComplete,
            ]
        );

        device.close();
        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn boot_only_linux_completes_on_size_ping() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[
                ("Image.gz", b"kernel".as_slice()),
                ("ramdisk.cpio.gz", b"initramfs".as_slice()),
            ],
            ImageKind::Boot,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("1-4"));
        let device = Arc::new(AstraDevice::new(
            link.clone(),
            recorder.clone(),
            &temp,
            true,
            "",
        ));

        // Empty boot command resolves the terminal image to uEnv.txt.
        let boot = boot_image(
            boot_files,
            true,
            UbootConsole::Uart,
            "ramdisk.cpio.gz",
            true,
        );
        device.boot(&boot).unwrap();

        link.push_interrupt(&request_packet(0x00, UENV_IMAGE));
        wait_until(|| recorder.has_send_complete(UENV_IMAGE));
        assert_ne!(device.status(), DeviceStatus::BootComplete);

        link.push_interrupt(&request_packet(0x80, SIZE_REPLY_IMAGE));
        wait_until(|| device.status() == DeviceStatus::BootComplete);

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_for_completion())
        };
        link.disconnect();
        waiter.join().unwrap().unwrap();

        assert_eq!(
            recorder.last_message_for(DeviceStatus::BootComplete).unwrap(),
            "Success"
        );

        let uenv = std::fs::read_to_string(device.device_dir.join(UENV_IMAGE)).unwrap();
        assert_eq!(uenv, "bootcmd=");

        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn spi_update_over_usb_console() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[("gen3_uboot.bin.usb", b"uboot".as_slice())],
            ImageKind::Boot,
        );
        let flash_files = write_images(
            &temp.join("flash-src"),
            &[("u-boot.spi.bin", b"spi payload".as_slice())],
            ImageKind::UpdateSpi,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("2-1"));
        let device = Arc::new(AstraDevice::new(
            link.clone(),
            recorder.clone(),
            &temp,
            false,
            "",
        ));

        let boot = boot_image(
            boot_files,
            false,
            UbootConsole::Usb,
            "gen3_uboot.bin.usb",
            false,
        );
        device.boot(&boot).unwrap();

        link.push_interrupt(&request_packet(0x00, "gen3_uboot.bin.usb"));
        wait_until(|| device.status() == DeviceStatus::BootComplete);

        let mut flash = flash_image(flash_files, FlashKind::Spi, "u-boot.spi.bin");
        flash.flash_command =
            "usbload u-boot.spi.bin 0x10000000; spinit; erase 0xf0000000 0xf01fffff; reset"
                .to_string();

        let updater = {
            let device = device.clone();
            let flash = flash.clone();
            std::thread::spawn(move || device.update(&flash))
        };
        // First U-Boot prompt releases the flash command.
        link.push_interrupt(b"=> ");
        updater.join().unwrap().unwrap();

        let injected = link.interrupt_writes();
        assert_eq!(
            injected[0],
            format!("{}\n", flash.flash_command).into_bytes()
        );

        link.push_interrupt(&request_packet(0x80, "u-boot.spi.bin"));
        wait_until(|| recorder.has_send_complete("u-boot.spi.bin"));
        link.push_interrupt(&request_packet(0x00, SIZE_REPLY_IMAGE));
        wait_until(|| device.status() == DeviceStatus::UpdateComplete);

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_for_completion())
        };
        // Second prompt after the flash command ran.
        link.push_interrupt(b"\r\n=> ");
        waiter.join().unwrap().unwrap();

        let injected = link.interrupt_writes();
        assert_eq!(injected[1], b"reset\n");
        assert_eq!(
            recorder
                .last_message_for(DeviceStatus::UpdateComplete)
                .unwrap(),
            "Success"
        );

        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn missing_image_fails_update() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[("gen3_uboot.bin.usb", b"uboot".as_slice())],
            ImageKind::Boot,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("1-7"));
        let device = Arc::new(AstraDevice::new(
            link.clone(),
            recorder.clone(),
            &temp,
            false,
            "",
        ));

        let boot = boot_image(
            boot_files,
            false,
            UbootConsole::Uart,
            "gen3_uboot.bin.usb",
            false,
        );
        device.boot(&boot).unwrap();

        link.push_interrupt(&request_packet(0x00, "gen3_uboot.bin.usb"));
        wait_until(|| device.status() == DeviceStatus::BootComplete);

        link.push_interrupt(&request_packet(0x00, "nope.subimg"));
        wait_until(|| device.status() == DeviceStatus::UpdateFail);
        wait_until(|| !device.shared.running.load(Ordering::SeqCst));

        assert_eq!(
            recorder.last_message_for(DeviceStatus::UpdateFail).unwrap(),
            "nope.subimg image not found"
        );

        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn request_timeout_during_boot_fails() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[
                ("gen3_miniloader.bin.usb", b"miniloader".as_slice()),
                ("gen3_uboot.bin.usb", b"uboot".as_slice()),
            ],
            ImageKind::Boot,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("1-9"));
        let mut device = AstraDevice::new(link.clone(), recorder.clone(), &temp, false, "");
        device.set_request_timeout(Duration::from_millis(100));
        let device = Arc::new(device);

        let boot = boot_image(
            boot_files,
            false,
            UbootConsole::Uart,
            "gen3_uboot.bin.usb",
            false,
        );
        device.boot(&boot).unwrap();

        // One non-terminal image moves the session into BootProgress.
        link.push_interrupt(&request_packet(0x00, "gen3_miniloader.bin.usb"));
        wait_until(|| recorder.has_send_complete("gen3_miniloader.bin.usb"));

        wait_until(|| device.status() == DeviceStatus::BootFail);
        wait_until(|| !device.shared.running.load(Ordering::SeqCst));
        assert_eq!(
            recorder.last_message_for(DeviceStatus::BootFail).unwrap(),
            BOOT_TIMEOUT_MESSAGE
        );

        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn miniloader_disconnect_is_not_a_failure() {
        let temp = scratch_dir();
        let boot_files = write_images(
            &temp.join("boot-src"),
            &[
                ("gen3_miniloader.bin.usb", b"miniloader".as_slice()),
                ("gen3_uboot.bin.usb", b"uboot".as_slice()),
            ],
            ImageKind::Boot,
        );

        let recorder = Recorder::new();
        let link = Arc::new(MockLink::new("3-2"));
        let device = Arc::new(AstraDevice::new(
            link.clone(),
            recorder.clone(),
            &temp,
            false,
            "",
        ));

        let boot = boot_image(
            boot_files,
            false,
            UbootConsole::Uart,
            "gen3_uboot.bin.usb",
            false,
        );
        device.boot(&boot).unwrap();

        link.push_interrupt(&request_packet(0x00, "gen3_miniloader.bin.usb"));
        wait_until(|| recorder.has_send_complete("gen3_miniloader.bin.usb"));

        // The miniloader resets the USB subsystem; the disconnect that
        // follows must not be reported as a failure.
        link.disconnect();
        wait_until(|| !device.shared.running.load(Ordering::SeqCst));

        assert!(!recorder.statuses().iter().any(|s| s.is_failure()));

        device.close();
        std::fs::remove_dir_all(&temp).ok();
    }
}
