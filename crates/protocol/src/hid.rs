//! HID class request constants and control setup construction
//!
//! The feature report operations use the INPUT (get) and OUTPUT (set)
//! report types in `wValue`. `REPORT_TYPE_FEATURE` is defined but unused by
//! them; existing callers depend on the INPUT/OUTPUT encoding.

use serde::{Deserialize, Serialize};

/// bRequest: GET_REPORT
pub const GET_REPORT: u8 = 0x01;
/// bRequest: SET_REPORT
pub const SET_REPORT: u8 = 0x09;

/// wValue high byte: input report
pub const REPORT_TYPE_INPUT: u16 = 0x0100;
/// wValue high byte: output report
pub const REPORT_TYPE_OUTPUT: u16 = 0x0200;
/// wValue high byte: feature report
pub const REPORT_TYPE_FEATURE: u16 = 0x0300;

/// bmRequestType direction bits
pub const USB_DIR_OUT: u8 = 0x00;
pub const USB_DIR_IN: u8 = 0x80;
/// bmRequestType type bits
pub const USB_TYPE_CLASS: u8 = 0x01 << 5;
/// bmRequestType recipient bits
pub const USB_RECIPIENT_INTERFACE: u8 = 0x01;

/// bInterfaceClass of HID interfaces
pub const HID_INTERFACE_CLASS: u8 = 0x03;

/// Setup fields of a control transfer
///
/// `wLength` is implied by the data buffer handed to the host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlSetup {
    /// Class SET_REPORT to the interface `interface`
    pub fn set_report(report_id: u8, interface: u8) -> Self {
        Self {
            request_type: USB_DIR_OUT | USB_TYPE_CLASS | USB_RECIPIENT_INTERFACE,
            request: SET_REPORT,
            value: u16::from(report_id) | REPORT_TYPE_OUTPUT,
            index: u16::from(interface),
        }
    }

    /// Class GET_REPORT from the interface `interface`
    pub fn get_report(report_id: u8, interface: u8) -> Self {
        Self {
            request_type: USB_DIR_IN | USB_TYPE_CLASS | USB_RECIPIENT_INTERFACE,
            request: GET_REPORT,
            value: u16::from(report_id) | REPORT_TYPE_INPUT,
            index: u16::from(interface),
        }
    }

    /// True for device-to-host requests (bmRequestType bit 7)
    pub fn is_in(&self) -> bool {
        self.request_type & USB_DIR_IN != 0
    }

    /// Report id carried in the low byte of `wValue`
    pub fn report_id(&self) -> u8 {
        (self.value & 0x00ff) as u8
    }
}
