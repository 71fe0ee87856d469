//! Status event stream for UI decoupling.
//!
//! The manager and every device session report progress through the
//! [`EventObserver`] trait so that a CLI, GUI, or test harness can subscribe
//! without coupling to the core logic.

use std::fmt;

/// Per-device lifecycle status.
///
/// Within one session the transitions are monotonic:
/// `Added → Opened → BootStart → BootProgress → (BootComplete | BootFail)
/// → [UpdateStart → UpdateProgress → (UpdateComplete | UpdateFail)]`.
/// The `ImageSend*` statuses are orthogonal and may appear at any point
/// while a boot or update is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device discovered by the transport.
    Added,
    /// USB session opened and endpoints claimed.
    Opened,
    /// Boot phase armed, waiting for the first image request.
    BootStart,
    /// Boot images are being served.
    BootProgress,
    BootComplete,
    BootFail,
    /// Update phase armed (first request after boot completed).
    UpdateStart,
    /// Update images are being served.
    UpdateProgress,
    UpdateComplete,
    UpdateFail,
    /// A single image transfer started.
    ImageSendStart,
    ImageSendProgress,
    ImageSendComplete,
    ImageSendFail,
}

impl DeviceStatus {
    /// True for the statuses that latch the process-level failure bit.
    pub fn is_failure(&self) -> bool {
        matches!(self, DeviceStatus::BootFail | DeviceStatus::UpdateFail)
    }

    /// True once a phase finished successfully.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            DeviceStatus::BootComplete | DeviceStatus::UpdateComplete
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Added => "Added",
            DeviceStatus::Opened => "Opened",
            DeviceStatus::BootStart => "BootStart",
            DeviceStatus::BootProgress => "BootProgress",
            DeviceStatus::BootComplete => "BootComplete",
            DeviceStatus::BootFail => "BootFail",
            DeviceStatus::UpdateStart => "UpdateStart",
            DeviceStatus::UpdateProgress => "UpdateProgress",
            DeviceStatus::UpdateComplete => "UpdateComplete",
            DeviceStatus::UpdateFail => "UpdateFail",
            DeviceStatus::ImageSendStart => "ImageSendStart",
            DeviceStatus::ImageSendProgress => "ImageSendProgress",
            DeviceStatus::ImageSendComplete => "ImageSendComplete",
            DeviceStatus::ImageSendFail => "ImageSendFail",
        };
        write!(f, "{s}")
    }
}

/// A single per-device status report.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub device: String,
    pub status: DeviceStatus,
    /// Percent complete, 0..100.
    pub progress: f64,
    pub image: String,
    pub message: String,
}

/// Manager-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Start,
    Info,
    Failure,
    Shutdown,
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerStatus::Start => "Start",
            ManagerStatus::Info => "Info",
            ManagerStatus::Failure => "Failure",
            ManagerStatus::Shutdown => "Shutdown",
        };
        write!(f, "{s}")
    }
}

/// A manager-level status report.
#[derive(Debug, Clone)]
pub struct ManagerUpdate {
    pub status: ManagerStatus,
    pub message: String,
}

/// Everything the observer can receive.
#[derive(Debug, Clone)]
pub enum Event {
    Device(DeviceUpdate),
    Manager(ManagerUpdate),
}

/// Observer trait for receiving status events.
///
/// Implement this in the embedding application. Callbacks are invoked from
/// worker threads; implementations must be cheap or hand off to a channel.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl EventObserver for NullObserver {
    fn on_event(&self, _event: &Event) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Device(update) => {
                tracing::info!(
                    device = %update.device,
                    status = %update.status,
                    progress = update.progress,
                    image = %update.image,
                    message = %update.message,
                    "Device status"
                );
            }
            Event::Manager(update) => {
                tracing::info!(status = %update.status, message = %update.message, "Manager status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_statuses_latch() {
        assert!(DeviceStatus::BootFail.is_failure());
        assert!(DeviceStatus::UpdateFail.is_failure());
        assert!(!DeviceStatus::ImageSendFail.is_failure());
        assert!(!DeviceStatus::BootProgress.is_failure());
    }

    #[test]
    fn complete_statuses() {
        assert!(DeviceStatus::BootComplete.is_complete());
        assert!(DeviceStatus::UpdateComplete.is_complete());
        assert!(!DeviceStatus::ImageSendComplete.is_complete());
    }
}
