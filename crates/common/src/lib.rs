//! Common utilities for hid-transport
//!
//! This crate provides shared functionality between the engine and the
//! applications driving it: the async channel bridge for USB worker
//! communication, error handling, logging setup, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{HidCommand, HidEvent, UsbBridge, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
