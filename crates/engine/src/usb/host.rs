//! Host USB access layer
//!
//! The engine never talks to libusb directly. Everything it needs from the
//! platform goes through these two traits, implemented by
//! [`RusbHost`](super::rusb_host::RusbHost) for real hardware and by
//! [`EmulatedHost`](super::emulated::EmulatedHost) for tests.
//!
//! Errors are reported as `rusb::Error` by both implementations so that the
//! mapping to [`protocol::HidError`] lives in one place.

use protocol::{ControlSetup, DeviceDescriptor, DeviceIdentifier, InterfaceInfo};
use std::time::Duration;

/// A device seen during enumeration, before any string descriptor is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub identifier: DeviceIdentifier,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Device-level host operations
pub trait UsbHost: Send + Sync + 'static {
    type Handle: HostHandle;

    /// One pass over the currently attached devices
    fn attached_devices(&self) -> Result<Vec<AttachedDevice>, rusb::Error>;

    /// Build the full descriptor, including serial number and product strings
    ///
    /// Fails with `rusb::Error::Access` when the strings cannot be read
    /// without permission.
    fn describe(&self, device: &AttachedDevice) -> Result<DeviceDescriptor, rusb::Error>;

    /// Open an exclusive handle on the device
    fn open(&self, identifier: &DeviceIdentifier) -> Result<Self::Handle, rusb::Error>;

    /// Ask for access to the device; must not block waiting for the answer
    fn request_permission(&self, identifier: &DeviceIdentifier);
}

/// Operations on an open device handle
///
/// Every operation takes `&self`: transfers on different endpoints run at
/// once, and claiming one interface must not wait for a transfer on another.
/// Implementations keep any claim bookkeeping behind their own lock.
pub trait HostHandle: Send + Sync + 'static {
    /// Interfaces of the currently active configuration
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error>;

    /// Claim an interface, detaching any kernel driver bound to it first
    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    /// Release a claimed interface and give it back to the kernel driver
    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn write_interrupt(
        &self,
        endpoint: u8,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn read_control(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn write_control(
        &self,
        setup: ControlSetup,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;
}
