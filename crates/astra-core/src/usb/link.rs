//! Seam between the orchestrator and the USB device session.
//!
//! The production implementation is [`super::UsbSession`]; tests drive the
//! orchestrator through [`super::MockLink`] instead.

use std::sync::Arc;

use thiserror::Error;

/// Events a link delivers to the orchestrator, in the order the device
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound interrupt packet (image request or console bytes).
    Interrupt(Vec<u8>),
    /// The device disconnected or reset.
    NoDevice,
    /// An in-flight transfer was cancelled by session teardown.
    TransferCancelled,
    /// An unrecoverable transfer error.
    TransferError,
}

/// Callback the orchestrator registers at open time. Invoked from the
/// link's callback worker thread, never from the transfer path itself.
pub type EventSink = Arc<dyn Fn(LinkEvent) + Send + Sync>;

#[derive(Error, Debug)]
pub enum UsbError {
    /// The device descriptor never settled; a USB reset was issued and the
    /// transport will rediscover the device.
    #[error("device in transient state, waiting for rediscovery")]
    TransientDeviceState,
    #[error("required {0} endpoint missing")]
    EndpointMissing(&'static str),
    #[error("device is no longer available")]
    NoDevice,
    #[error("endpoint halted and the halt could not be cleared: {0}")]
    EndpointHalted(rusb::Error),
    #[error("session is not running")]
    NotRunning,
    #[error("usb transfer failed: {0}")]
    Transfer(rusb::Error),
    #[error(transparent)]
    Usb(#[from] rusb::Error),
}

/// One opened USB device in recovery mode.
pub trait DeviceLink: Send + Sync {
    /// Open and configure the device and start receiving interrupts.
    /// Events queue until [`DeviceLink::enable_interrupts`] starts delivery.
    fn open(&self, sink: EventSink) -> Result<(), UsbError>;

    /// Start the callback worker that delivers queued events. Idempotent.
    fn enable_interrupts(&self) -> Result<(), UsbError>;

    /// Send one bulk-OUT payload; blocks until the transfer completes.
    fn write(&self, data: &[u8]) -> Result<usize, UsbError>;

    /// Fire-and-forget write on the interrupt-OUT endpoint.
    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError>;

    fn usb_path(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Tear the session down. Idempotent; all worker threads are joined and
    /// no event is delivered after this returns.
    fn close(&self);
}
