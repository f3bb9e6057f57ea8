//! Device enumeration
//!
//! Lists attached devices matching an optional vendor/product id pair and the
//! configured VID:PID filters. Devices whose strings cannot be read without
//! permission trigger a permission request and are left out of the result;
//! the caller is expected to list again once access was granted.

use crate::usb::host::{AttachedDevice, UsbHost};
use common::HidEvent;
use protocol::{DeviceDescriptor, HidError};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DeviceCatalog<U: UsbHost> {
    host: Arc<U>,
    /// Device filters (VID:PID patterns)
    allowed_filters: Vec<String>,
    /// Permission requests are published here when set
    event_sender: Option<async_channel::Sender<HidEvent>>,
}

impl<U: UsbHost> DeviceCatalog<U> {
    pub fn new(host: Arc<U>, allowed_filters: Vec<String>) -> Self {
        Self {
            host,
            allowed_filters,
            event_sender: None,
        }
    }

    /// Publish a `PermissionRequested` event for every skipped device
    pub fn with_events(mut self, event_sender: async_channel::Sender<HidEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// One pass over the attached devices
    ///
    /// Results follow the host's enumeration order.
    pub fn list(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DeviceDescriptor>, HidError> {
        let attached = self.host.attached_devices().map_err(|e| {
            warn!("Device enumeration failed: {}", e);
            HidError::TransferFailed(format!("Device enumeration failed: {}", e))
        })?;

        let mut devices = Vec::new();
        for device in attached
            .iter()
            .filter(|d| matches_ids(d, vendor_id, product_id))
            .filter(|d| self.is_device_allowed(d))
        {
            match self.host.describe(device) {
                Ok(descriptor) => devices.push(descriptor),
                Err(rusb::Error::Access) => self.request_permission(device),
                Err(e) => {
                    warn!("Skipping device {}: {}", device.identifier, e);
                }
            }
        }

        debug!("Listed {} of {} attached devices", devices.len(), attached.len());
        Ok(devices)
    }

    fn request_permission(&self, device: &AttachedDevice) {
        info!(
            "Requesting permission for {} ({:04x}:{:04x})",
            device.identifier, device.vendor_id, device.product_id
        );
        self.host.request_permission(&device.identifier);

        if let Some(sender) = &self.event_sender {
            let event = HidEvent::PermissionRequested {
                device: device.identifier.clone(),
            };
            if let Err(e) = sender.try_send(event) {
                debug!("Dropped permission event: {}", e);
            }
        }
    }

    /// Check if a device is allowed by the configured filters
    fn is_device_allowed(&self, device: &AttachedDevice) -> bool {
        let allowed = check_filter(device.vendor_id, device.product_id, &self.allowed_filters);
        if !allowed {
            debug!(
                "Device ignored by filter: {} vid={:#x}, pid={:#x}",
                device.identifier, device.vendor_id, device.product_id
            );
        }
        allowed
    }
}

fn matches_ids(device: &AttachedDevice, vendor_id: Option<u16>, product_id: Option<u16>) -> bool {
    vendor_id.is_none_or(|vid| vid == device.vendor_id)
        && product_id.is_none_or(|pid| pid == device.product_id)
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filter format: "0xVID:0xPID", with `*` matching any id.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    // If no filters are defined, all devices are allowed
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
    })
}

fn matches_id(pattern: &str, id: u16) -> bool {
    pattern == "*"
        || u16::from_str_radix(pattern.trim_start_matches("0x"), 16)
            .map(|v| v == id)
            .unwrap_or(false)
}
