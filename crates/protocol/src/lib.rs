//! Protocol library for hid-transport
//!
//! This crate defines the plain data types shared by the engine and its
//! callers: device descriptors and identifiers, the interface/endpoint
//! topology of a device's active configuration, the HID class request
//! constants with their control setup builders, and the error taxonomy.
//!
//! Nothing in here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlSetup, REPORT_TYPE_OUTPUT};
//!
//! let setup = ControlSetup::set_report(0x02, 0);
//! assert_eq!(setup.request_type, 0x21);
//! assert_eq!(setup.value, 0x02 | REPORT_TYPE_OUTPUT);
//! ```

pub mod error;
pub mod hid;
pub mod types;

pub use error::{HidError, HidErrorKind, Result};
pub use hid::{
    ControlSetup, GET_REPORT, HID_INTERFACE_CLASS, REPORT_TYPE_FEATURE, REPORT_TYPE_INPUT,
    REPORT_TYPE_OUTPUT, SET_REPORT, USB_DIR_IN, USB_DIR_OUT, USB_RECIPIENT_INTERFACE,
    USB_TYPE_CLASS,
};
pub use types::{
    DeviceDescriptor, DeviceIdentifier, EndpointDirection, EndpointInfo, EndpointKind,
    EndpointTransfer, InterfaceEndpointRef, InterfaceInfo,
};
