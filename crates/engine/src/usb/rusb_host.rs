//! libusb-backed host
//!
//! Devices are addressed by "BBB/DDD" (bus/address). Kernel drivers bound to
//! an interface are detached when the interface is claimed and reattached
//! when it is released.

use crate::usb::host::{AttachedDevice, HostHandle, UsbHost};
use protocol::{
    ControlSetup, DeviceDescriptor, DeviceIdentifier, EndpointDirection, EndpointInfo,
    EndpointTransfer, InterfaceInfo,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Host backed by a libusb context
pub struct RusbHost {
    context: Context,
    detach_kernel_driver: bool,
}

impl RusbHost {
    /// Create a new libusb context
    pub fn new(detach_kernel_driver: bool) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        Ok(Self {
            context,
            detach_kernel_driver,
        })
    }

    fn find_device(&self, identifier: &DeviceIdentifier) -> Result<Device<Context>, rusb::Error> {
        let (bus, address) = identifier.bus_address().ok_or(rusb::Error::NotFound)?;

        self.context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(rusb::Error::NotFound)
    }
}

impl UsbHost for RusbHost {
    type Handle = RusbHandle;

    fn attached_devices(&self) -> Result<Vec<AttachedDevice>, rusb::Error> {
        let devices = self.context.devices()?;
        let mut attached = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!(
                        "Skipping device {:03}/{:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            attached.push(AttachedDevice {
                identifier: DeviceIdentifier::from_bus_address(
                    device.bus_number(),
                    device.address(),
                ),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }

        Ok(attached)
    }

    fn describe(&self, attached: &AttachedDevice) -> Result<DeviceDescriptor, rusb::Error> {
        let device = self.find_device(&attached.identifier)?;
        let desc = device.device_descriptor()?;

        // String descriptors need an open handle, which needs permission
        let handle = device.open()?;
        let serial_number = read_string(&handle, desc.serial_number_string_index())?;
        let product_name = read_string(&handle, desc.product_string_index())?;

        Ok(DeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            serial_number,
            product_name,
            identifier: attached.identifier.clone(),
        })
    }

    fn open(&self, identifier: &DeviceIdentifier) -> Result<RusbHandle, rusb::Error> {
        let handle = self.find_device(identifier)?.open()?;
        debug!("Opened libusb handle for {}", identifier);

        Ok(RusbHandle {
            handle,
            detach_kernel_driver: self.detach_kernel_driver,
            detached: Mutex::new(BTreeSet::new()),
        })
    }

    fn request_permission(&self, identifier: &DeviceIdentifier) {
        // libusb has no interactive grant; access comes from udev rules
        warn!(
            "No permission to access {}; add a udev rule granting access to the device node",
            identifier
        );
    }
}

/// Open libusb handle
pub struct RusbHandle {
    handle: DeviceHandle<Context>,
    detach_kernel_driver: bool,
    /// Interfaces whose kernel driver we detached
    detached: Mutex<BTreeSet<u8>>,
}

impl HostHandle for RusbHandle {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        let config = self.handle.device().active_config_descriptor()?;

        Ok(config
            .interfaces()
            .filter_map(|interface| {
                // Alternate settings are not used; the first one is active
                let desc = interface.descriptors().next()?;
                let endpoints = desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        transfer_type: map_transfer_type(ep.transfer_type()),
                        direction: map_direction(ep.direction()),
                    })
                    .collect();
                Some(InterfaceInfo::new(
                    interface.number(),
                    desc.class_code(),
                    endpoints,
                ))
            })
            .collect())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        if self.detach_kernel_driver {
            match self.handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    self.handle.detach_kernel_driver(interface)?;
                    self.detached().insert(interface);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface, e
                    );
                }
            }
        }

        if let Err(e) = self.handle.claim_interface(interface) {
            self.reattach(interface);
            return Err(e);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let result = self.handle.release_interface(interface);
        self.reattach(interface);
        result
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.write_interrupt(endpoint, buf, timeout)
    }

    fn read_control(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }

    fn write_control(
        &self,
        setup: ControlSetup,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }
}

impl RusbHandle {
    fn reattach(&self, interface: u8) {
        if !self.detached().remove(&interface) {
            return;
        }
        match self.handle.attach_kernel_driver(interface) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
            Err(e) => debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            ),
        }
    }

    fn detached(&self) -> MutexGuard<'_, BTreeSet<u8>> {
        self.detached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read an ASCII string descriptor
///
/// Missing or unreadable strings become empty; only a permission error is
/// reported.
fn read_string(handle: &DeviceHandle<Context>, index: Option<u8>) -> Result<String, rusb::Error> {
    let Some(index) = index else {
        return Ok(String::new());
    };
    match handle.read_string_descriptor_ascii(index) {
        Ok(s) => Ok(s),
        Err(rusb::Error::Access) => Err(rusb::Error::Access),
        Err(e) => {
            debug!("Failed to read string descriptor {}: {}", index, e);
            Ok(String::new())
        }
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointTransfer {
    match transfer_type {
        rusb::TransferType::Control => EndpointTransfer::Control,
        rusb::TransferType::Isochronous => EndpointTransfer::Isochronous,
        rusb::TransferType::Bulk => EndpointTransfer::Bulk,
        rusb::TransferType::Interrupt => EndpointTransfer::Interrupt,
    }
}

fn map_direction(direction: rusb::Direction) -> EndpointDirection {
    match direction {
        rusb::Direction::In => EndpointDirection::In,
        rusb::Direction::Out => EndpointDirection::Out,
    }
}
