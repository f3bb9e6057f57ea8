//! HID transport engine
//!
//! Opens USB HID devices, moves input/output reports over their interrupt
//! endpoints and feature reports over class control transfers.

pub mod config;
pub mod usb;

pub use config::EngineConfig;
