//! USB device session layer.

mod link;
mod mock;
mod session;

pub use link::{DeviceLink, EventSink, LinkEvent, UsbError};
pub use mock::MockLink;
pub use session::{Endpoints, UsbSession};
