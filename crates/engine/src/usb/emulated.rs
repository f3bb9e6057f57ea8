//! Emulated USB host
//!
//! An in-memory implementation of the host layer. Devices carry a scripted
//! topology, queued input reports and fixed feature reports, and can be told
//! to refuse access, deny claims or fail transfers. Every claim, release,
//! write and control transfer is recorded so tests can inspect exactly what
//! reached the "wire".

use crate::usb::host::{AttachedDevice, HostHandle, UsbHost};
use protocol::{ControlSetup, DeviceDescriptor, DeviceIdentifier, InterfaceInfo};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One control transfer as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub setup: ControlSetup,
    /// Data sent (OUT) or empty (IN)
    pub data: Vec<u8>,
    /// wLength
    pub length: usize,
}

#[derive(Default)]
struct DeviceState {
    interfaces: Vec<InterfaceInfo>,
    accessible: bool,
    input_reports: VecDeque<Vec<u8>>,
    feature_reports: HashMap<u8, Vec<u8>>,
    denied_claims: BTreeSet<u8>,
    transfer_error: Option<rusb::Error>,
    failing_release: bool,
    short_write: Option<usize>,
    claim_delay: Option<Duration>,
    read_delay: Option<Duration>,

    claim_calls: Vec<u8>,
    release_calls: Vec<u8>,
    writes: Vec<(u8, Vec<u8>)>,
    controls: Vec<ControlRecord>,
    open_handles: usize,
}

/// A scripted device
///
/// Clones share state, so a test can keep a clone after handing the device
/// to an [`EmulatedHost`] and inspect what happened to it.
#[derive(Clone)]
pub struct EmulatedDevice {
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<DeviceState>>,
}

impl EmulatedDevice {
    pub fn new(identifier: impl Into<DeviceIdentifier>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                vendor_id,
                product_id,
                serial_number: String::new(),
                product_name: String::new(),
                identifier: identifier.into(),
            },
            state: Arc::new(Mutex::new(DeviceState {
                accessible: true,
                ..Default::default()
            })),
        }
    }

    pub fn identifier(&self) -> &DeviceIdentifier {
        &self.descriptor.identifier
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn with_interfaces(self, interfaces: Vec<InterfaceInfo>) -> Self {
        self.state().interfaces = interfaces;
        self
    }

    pub fn with_strings(mut self, product_name: &str, serial_number: &str) -> Self {
        self.descriptor.product_name = product_name.to_string();
        self.descriptor.serial_number = serial_number.to_string();
        self
    }

    /// Refuse to describe or open the device until permission is granted
    pub fn without_permission(self) -> Self {
        self.state().accessible = false;
        self
    }

    pub fn with_input_report(self, report: Vec<u8>) -> Self {
        self.state().input_reports.push_back(report);
        self
    }

    /// Fixed answer to GET_REPORT for `report_id`
    pub fn with_feature_report(self, report_id: u8, report: Vec<u8>) -> Self {
        self.state().feature_reports.insert(report_id, report);
        self
    }

    pub fn deny_claim(self, interface: u8) -> Self {
        self.state().denied_claims.insert(interface);
        self
    }

    /// Fail every data and control transfer with `error`
    pub fn failing_transfers(self, error: rusb::Error) -> Self {
        self.state().transfer_error = Some(error);
        self
    }

    pub fn failing_release(self) -> Self {
        self.state().failing_release = true;
        self
    }

    /// Accept at most `max` bytes per interrupt write
    pub fn with_short_writes(self, max: usize) -> Self {
        self.state().short_write = Some(max);
        self
    }

    pub fn with_claim_delay(self, delay: Duration) -> Self {
        self.state().claim_delay = Some(delay);
        self
    }

    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.state().read_delay = Some(delay);
        self
    }

    /// Replace the active configuration
    pub fn reconfigure(&self, interfaces: Vec<InterfaceInfo>) {
        self.state().interfaces = interfaces;
    }

    pub fn push_input_report(&self, report: Vec<u8>) {
        self.state().input_reports.push_back(report);
    }

    pub fn pending_input_reports(&self) -> usize {
        self.state().input_reports.len()
    }

    /// Interfaces passed to claim, in call order
    pub fn claim_calls(&self) -> Vec<u8> {
        self.state().claim_calls.clone()
    }

    pub fn release_calls(&self) -> Vec<u8> {
        self.state().release_calls.clone()
    }

    /// (endpoint, data) of every interrupt write
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().writes.clone()
    }

    pub fn control_transfers(&self) -> Vec<ControlRecord> {
        self.state().controls.clone()
    }

    /// Handles currently open on this device
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory host holding a list of attached [`EmulatedDevice`]s
#[derive(Clone, Default)]
pub struct EmulatedHost {
    devices: Arc<Mutex<Vec<EmulatedDevice>>>,
    permission_requests: Arc<Mutex<Vec<DeviceIdentifier>>>,
}

impl EmulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device
    pub fn add_device(&self, device: EmulatedDevice) {
        self.devices().push(device);
    }

    /// Detach a device; open handles keep working on their own state
    pub fn remove_device(&self, identifier: &DeviceIdentifier) {
        self.devices().retain(|d| d.identifier() != identifier);
    }

    /// Simulate the user granting access to a device
    pub fn grant_permission(&self, identifier: &DeviceIdentifier) {
        if let Some(device) = self.find(identifier) {
            device.state().accessible = true;
        }
    }

    /// Devices for which access was requested, in request order
    pub fn permission_requests(&self) -> Vec<DeviceIdentifier> {
        self.permission_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn find(&self, identifier: &DeviceIdentifier) -> Option<EmulatedDevice> {
        self.devices()
            .iter()
            .find(|d| d.identifier() == identifier)
            .cloned()
    }

    fn devices(&self) -> MutexGuard<'_, Vec<EmulatedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsbHost for EmulatedHost {
    type Handle = EmulatedHandle;

    fn attached_devices(&self) -> Result<Vec<AttachedDevice>, rusb::Error> {
        Ok(self
            .devices()
            .iter()
            .map(|d| AttachedDevice {
                identifier: d.descriptor.identifier.clone(),
                vendor_id: d.descriptor.vendor_id,
                product_id: d.descriptor.product_id,
            })
            .collect())
    }

    fn describe(&self, device: &AttachedDevice) -> Result<DeviceDescriptor, rusb::Error> {
        let emulated = self.find(&device.identifier).ok_or(rusb::Error::NoDevice)?;
        if !emulated.state().accessible {
            return Err(rusb::Error::Access);
        }
        Ok(emulated.descriptor.clone())
    }

    fn open(&self, identifier: &DeviceIdentifier) -> Result<EmulatedHandle, rusb::Error> {
        let device = self.find(identifier).ok_or(rusb::Error::NotFound)?;
        {
            let mut state = device.state();
            if !state.accessible {
                return Err(rusb::Error::Access);
            }
            state.open_handles += 1;
        }
        Ok(EmulatedHandle { device })
    }

    fn request_permission(&self, identifier: &DeviceIdentifier) {
        self.permission_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identifier.clone());
    }
}

/// Open handle on an [`EmulatedDevice`]
pub struct EmulatedHandle {
    device: EmulatedDevice,
}

impl EmulatedHandle {
    fn check_endpoint(&self, endpoint: u8) -> Result<(), rusb::Error> {
        let state = self.device.state();
        if let Some(error) = state.transfer_error {
            return Err(error);
        }
        let known = state
            .interfaces
            .iter()
            .flat_map(|i| i.endpoints.iter())
            .any(|e| e.address == endpoint);
        if known { Ok(()) } else { Err(rusb::Error::InvalidParam) }
    }
}

impl HostHandle for EmulatedHandle {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        Ok(self.device.state().interfaces.clone())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let delay = {
            let mut state = self.device.state();
            state.claim_calls.push(interface);
            state.claim_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let state = self.device.state();
        if state.denied_claims.contains(&interface) {
            return Err(rusb::Error::Busy);
        }
        if !state.interfaces.iter().any(|i| i.number == interface) {
            return Err(rusb::Error::NotFound);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let mut state = self.device.state();
        state.release_calls.push(interface);
        if state.failing_release {
            return Err(rusb::Error::NoDevice);
        }
        Ok(())
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.check_endpoint(endpoint)?;

        let delay = self.device.state().read_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay.min(timeout));
        }

        match self.device.state().input_reports.pop_front() {
            Some(report) => {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            None => Err(rusb::Error::Timeout),
        }
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.check_endpoint(endpoint)?;

        let mut state = self.device.state();
        let len = state.short_write.map_or(buf.len(), |max| max.min(buf.len()));
        state.writes.push((endpoint, buf[..len].to_vec()));
        Ok(len)
    }

    fn read_control(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.device.state();
        if let Some(error) = state.transfer_error {
            return Err(error);
        }
        state.controls.push(ControlRecord {
            setup,
            data: Vec::new(),
            length: buf.len(),
        });

        // Unknown reports stall the control pipe
        let report = state
            .feature_reports
            .get(&setup.report_id())
            .ok_or(rusb::Error::Pipe)?;
        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        setup: ControlSetup,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.device.state();
        if let Some(error) = state.transfer_error {
            return Err(error);
        }
        state.controls.push(ControlRecord {
            setup,
            data: buf.to_vec(),
            length: buf.len(),
        });
        Ok(buf.len())
    }
}

impl Drop for EmulatedHandle {
    fn drop(&mut self) {
        let mut state = self.device.state();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}
