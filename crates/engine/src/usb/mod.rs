//! USB subsystem
//!
//! HID transport over libusb:
//! - endpoint discovery on the live configuration
//! - device sessions with lazy interface claiming
//! - interrupt and HID class control transfers
//! - enumeration with permission handling
//!
//! Everything runs on a dedicated worker thread (plus one thread per
//! in-flight transfer) and is driven from Tokio through the channel bridge
//! in `common`.

pub mod catalog;
pub mod emulated;
pub mod host;
pub mod locator;
pub mod registry;
pub mod rusb_host;
pub mod session;
pub mod transfers;
pub mod worker;

// Re-export public types
pub use catalog::DeviceCatalog;
pub use emulated::{EmulatedDevice, EmulatedHandle, EmulatedHost};
pub use host::{AttachedDevice, HostHandle, UsbHost};
pub use registry::SessionRegistry;
pub use rusb_host::RusbHost;
pub use session::{DeviceSession, SessionSettings, TransferTimeouts};
pub use worker::{UsbWorkerThread, WorkerSettings, spawn_usb_worker};
