//! Device and topology type definitions
//!
//! This module defines the descriptor snapshot returned by enumeration and
//! the minimal view of a device's active configuration that endpoint
//! discovery works on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque device identifier
///
/// Produced by the host layer during enumeration and handed back to it to
/// re-open the same device. The rusb host uses the zero-padded
/// `bus/address` pair (`"001/004"`), matching the usbfs device path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentifier(pub String);

impl DeviceIdentifier {
    /// Build the identifier for a device at `bus`/`address`
    pub fn from_bus_address(bus: u8, address: u8) -> Self {
        Self(format!("{:03}/{:03}", bus, address))
    }

    /// Parse a `bus/address` identifier back into its numbers
    ///
    /// Returns `None` for identifiers that were not produced by
    /// [`DeviceIdentifier::from_bus_address`].
    pub fn bus_address(&self) -> Option<(u8, u8)> {
        let (bus, address) = self.0.trim_start_matches("/dev/bus/usb/").split_once('/')?;
        Some((bus.parse().ok()?, address.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Device information returned by enumeration
///
/// Immutable snapshot; string fields are empty when the device does not
/// provide the corresponding string descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Serial number string (may be empty)
    pub serial_number: String,
    /// Product string (may be empty)
    pub product_name: String,
    /// Identifier used to open the device
    pub identifier: DeviceIdentifier,
}

/// Transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointTransfer {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Direction of an endpoint, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// One endpoint of an interface in the active configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint address (includes direction bit)
    pub address: u8,
    pub transfer_type: EndpointTransfer,
    pub direction: EndpointDirection,
}

impl EndpointInfo {
    /// Interrupt endpoint; the direction is derived from the address bit 7
    pub fn interrupt(address: u8) -> Self {
        Self {
            address,
            transfer_type: EndpointTransfer::Interrupt,
            direction: direction_of(address),
        }
    }

    /// Bulk endpoint; the direction is derived from the address bit 7
    pub fn bulk(address: u8) -> Self {
        Self {
            address,
            transfer_type: EndpointTransfer::Bulk,
            direction: direction_of(address),
        }
    }
}

fn direction_of(address: u8) -> EndpointDirection {
    if address & 0x80 != 0 {
        EndpointDirection::In
    } else {
        EndpointDirection::Out
    }
}

/// One interface of the active configuration (first alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// bInterfaceNumber, used for claiming and as the HID `wIndex`
    pub number: u8,
    /// bInterfaceClass
    pub class_code: u8,
    /// Endpoints in descriptor order
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn new(number: u8, class_code: u8, endpoints: Vec<EndpointInfo>) -> Self {
        Self {
            number,
            class_code,
            endpoints,
        }
    }
}

/// Position of one endpoint inside the topology list
///
/// Only meaningful against the topology it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceEndpointRef {
    pub interface_index: usize,
    pub endpoint_index: usize,
}

impl InterfaceEndpointRef {
    pub fn new(interface_index: usize, endpoint_index: usize) -> Self {
        Self {
            interface_index,
            endpoint_index,
        }
    }
}

/// Which endpoint a transfer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Interrupt IN endpoint for stream reads
    Read,
    /// Interrupt OUT endpoint for stream writes
    Write,
    /// Interrupt IN endpoint of the HID-class interface, for control transfers
    HidControl,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Read => f.write_str("interrupt IN"),
            EndpointKind::Write => f.write_str("interrupt OUT"),
            EndpointKind::HidControl => f.write_str("HID interrupt IN"),
        }
    }
}
