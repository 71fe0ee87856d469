//! astra-core: boot and flash Astra SoC boards over USB recovery mode.
//!
//! In recovery mode the board drives the host: it posts image requests on
//! an interrupt endpoint and the host answers with length-prefixed file
//! payloads on a bulk endpoint. Boot (first-stage loaders, U-Boot, an
//! optional uEnv bootscript, an optional kernel) and flash updates (an
//! eMMC partition stream or an SPI image plus a U-Boot command typed over
//! a virtual console) are both realized through that request/reply dance.
//!
//! # Architecture
//!
//! - **Protocol**: the image-request sentinel and the reply framing
//! - **Usb**: the per-device session over rusb, plus a mock link for tests
//! - **Console**: U-Boot console multiplexed onto the interrupt endpoints
//! - **Device**: the per-device orchestrator (boot → update → completion)
//! - **Transport**: USB context lifetime, hotplug discovery, port filter,
//!   cross-process critical section
//! - **Events**: observer pattern for UI decoupling
//! - **Manager**: one orchestrator thread per discovered device
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use astra_core::{DeviceManager, FlashConfig, FlashImage, ManagerConfig, TracingObserver};
//!
//! let flash = FlashImage::load("eMMCimg".as_ref(), FlashConfig::default())?;
//! let manager = DeviceManager::new(ManagerConfig::default(), Arc::new(TracingObserver))?;
//! manager.update(flash, "astra-usbboot-images".as_ref())?;
//! // ... consume status events, then:
//! manager.shutdown();
//! # anyhow::Ok(())
//! ```

pub mod boot_image;
pub mod collection;
pub mod console;
pub mod device;
pub mod events;
pub mod flash_image;
pub mod image;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod usb;

pub use boot_image::{
    BootImage, BootImageError, MemoryLayout, SecureBootVersion, UbootConsole, UbootVariant,
};
pub use collection::{BootImageCollection, CollectionError};
pub use console::Console;
pub use device::AstraDevice;
pub use events::{
    DeviceStatus, DeviceUpdate, Event, EventObserver, ManagerStatus, ManagerUpdate, NullObserver,
    TracingObserver,
};
pub use flash_image::{FlashConfig, FlashImage, FlashImageError, FlashKind};
pub use image::{Image, ImageError, ImageKind};
pub use manager::{DeviceManager, ManagerConfig};
pub use transport::{PortFilter, Transport, TransportError};
pub use usb::{DeviceLink, LinkEvent, MockLink, UsbError, UsbSession};
