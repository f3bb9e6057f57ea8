//! USB transfer execution
//!
//! The four HID transfer primitives. Each one resolves its endpoint against
//! the live configuration, makes sure the owning interface is claimed, then
//! runs one blocking transfer through the session's handle. Failures are
//! reported once and never retried here.

use crate::usb::host::HostHandle;
use crate::usb::session::DeviceSession;
use protocol::{ControlSetup, EndpointKind, HidError};
use std::time::Duration;
use tracing::{debug, warn};

/// Interrupt IN read of up to `length` bytes
///
/// A timeout is not an error and returns an empty read. libusb does not
/// report how many bytes arrived before a timeout, so a partial report is
/// dropped rather than returned.
pub fn read<H: HostHandle>(
    session: &DeviceSession<H>,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, HidError> {
    if length == 0 {
        return Err(HidError::InvalidArgument(
            "read length must be greater than 0".to_string(),
        ));
    }

    let endpoint = session.locate(EndpointKind::Read)?;
    session.ensure_claimed(endpoint.interface)?;

    session.with_handle(|handle| {
        debug!(
            "Interrupt read: endpoint={:#x}, length={}, timeout={}ms",
            endpoint.address,
            length,
            timeout.as_millis()
        );

        let mut buffer = vec![0u8; length];
        match handle.read_interrupt(endpoint.address, &mut buffer, timeout) {
            Ok(len) => {
                buffer.truncate(len);
                debug!("Interrupt read succeeded: {} bytes", len);
                Ok(buffer)
            }
            Err(rusb::Error::Timeout) => {
                debug!(
                    "Interrupt read on endpoint {:#x} timed out with no data",
                    endpoint.address
                );
                Ok(Vec::new())
            }
            Err(e) => {
                warn!("Interrupt read failed: {}", e);
                Err(map_rusb_error(e))
            }
        }
    })
}

/// Interrupt OUT write of the whole buffer, bounded by the write timeout
pub fn write<H: HostHandle>(session: &DeviceSession<H>, data: &[u8]) -> Result<(), HidError> {
    let endpoint = session.locate(EndpointKind::Write)?;
    session.ensure_claimed(endpoint.interface)?;
    let timeout = session.timeouts().write;

    session.with_handle(|handle| {
        debug!(
            "Interrupt write: endpoint={:#x}, data_len={}",
            endpoint.address,
            data.len()
        );

        let written = handle
            .write_interrupt(endpoint.address, data, timeout)
            .map_err(|e| {
                warn!("Interrupt write failed: {}", e);
                map_rusb_error(e)
            })?;

        if written < data.len() {
            warn!("Short interrupt write: {} of {} bytes", written, data.len());
            return Err(HidError::TransferFailed(format!(
                "Short write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    })
}

/// HID SET_REPORT: `data[0]` is the report id, the rest is sent as payload
pub fn set_feature_report<H: HostHandle>(
    session: &DeviceSession<H>,
    data: &[u8],
) -> Result<(), HidError> {
    let (&report_id, payload) = split_report(data)?;

    let endpoint = session.locate(EndpointKind::HidControl)?;
    session.ensure_claimed(endpoint.interface)?;
    let setup = ControlSetup::set_report(report_id, endpoint.interface);
    let timeout = session.timeouts().control;

    session.with_handle(|handle| {
        debug!(
            "Control write: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            payload.len()
        );

        handle
            .write_control(setup, payload, timeout)
            .map(|_| ())
            .map_err(|e| {
                warn!("SET_REPORT {:#x} failed: {}", report_id, e);
                map_rusb_error(e)
            })
    })
}

/// HID GET_REPORT: `data[0]` is the report id, `data.len() - 1` bytes are
/// requested
///
/// The report id is not echoed back in the result.
pub fn get_feature_report<H: HostHandle>(
    session: &DeviceSession<H>,
    data: &[u8],
) -> Result<Vec<u8>, HidError> {
    let (&report_id, rest) = split_report(data)?;

    let endpoint = session.locate(EndpointKind::HidControl)?;
    session.ensure_claimed(endpoint.interface)?;
    let setup = ControlSetup::get_report(report_id, endpoint.interface);
    let timeout = session.timeouts().control;

    session.with_handle(|handle| {
        debug!(
            "Control read: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            rest.len()
        );

        let mut buffer = vec![0u8; rest.len()];
        let len = handle
            .read_control(setup, &mut buffer, timeout)
            .map_err(|e| {
                warn!("GET_REPORT {:#x} failed: {}", report_id, e);
                map_rusb_error(e)
            })?;
        buffer.truncate(len);
        Ok(buffer)
    })
}

fn split_report(data: &[u8]) -> Result<(&u8, &[u8]), HidError> {
    data.split_first().ok_or_else(|| {
        HidError::InvalidArgument("report buffer must start with the report id".to_string())
    })
}

/// Map rusb::Error to a transfer failure
pub fn map_rusb_error(err: rusb::Error) -> HidError {
    HidError::TransferFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::emulated::{EmulatedDevice, EmulatedHandle, EmulatedHost};
    use crate::usb::session::TransferTimeouts;
    use common::test_utils::{bulk_only_topology, composite_topology, hid_topology};
    use protocol::{GET_REPORT, HidErrorKind, SET_REPORT};

    fn session_for(device: &EmulatedDevice) -> DeviceSession<EmulatedHandle> {
        let host = EmulatedHost::new();
        host.add_device(device.clone());
        DeviceSession::open(&host, device.identifier().clone(), TransferTimeouts::default())
            .unwrap()
    }

    fn keyboard() -> EmulatedDevice {
        EmulatedDevice::new("kbd", 0x1234, 0x5678).with_interfaces(hid_topology())
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Pipe).kind(), HidErrorKind::TransferFailed);
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            HidError::TransferFailed(rusb::Error::NoDevice.to_string())
        );
    }

    #[test]
    fn test_read_returns_received_bytes() {
        let device = keyboard().with_input_report(vec![1, 2, 3]);
        let session = session_for(&device);

        let data = read(&session, 64, Duration::from_millis(50)).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(device.claim_calls(), vec![0]);
    }

    #[test]
    fn test_read_truncates_to_requested_length() {
        let device = keyboard().with_input_report(vec![9; 16]);
        let session = session_for(&device);

        let data = read(&session, 4, Duration::from_millis(50)).unwrap();
        assert_eq!(data, vec![9; 4]);
    }

    #[test]
    fn test_read_timeout_is_empty_success() {
        let device = keyboard();
        let session = session_for(&device);

        let data = read(&session, 8, Duration::from_millis(10)).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_read_zero_length() {
        let session = session_for(&keyboard());
        let err = read(&session, 0, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::InvalidArgument);
    }

    #[test]
    fn test_read_io_error() {
        let device = keyboard().failing_transfers(rusb::Error::Io);
        let session = session_for(&device);

        let err = read(&session, 8, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::TransferFailed);
    }

    #[test]
    fn test_read_without_endpoint() {
        let device = EmulatedDevice::new("bulk", 0x1234, 0x0001).with_interfaces(bulk_only_topology());
        let session = session_for(&device);

        let err = read(&session, 8, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, HidError::EndpointNotFound(EndpointKind::Read));
        assert!(device.claim_calls().is_empty());
    }

    #[test]
    fn test_read_claim_failure_prevents_transfer() {
        let device = keyboard().deny_claim(0).with_input_report(vec![1]);
        let session = session_for(&device);

        let err = read(&session, 8, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::InterfaceClaimFailed);
        assert_eq!(device.pending_input_reports(), 1);
    }

    #[test]
    fn test_write_sends_whole_buffer() {
        let device = keyboard();
        let session = session_for(&device);

        write(&session, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(device.writes(), vec![(0x01, vec![0xde, 0xad, 0xbe, 0xef])]);
    }

    #[test]
    fn test_write_uses_write_interface_on_composite() {
        let device = EmulatedDevice::new("combo", 0x1234, 0x0003).with_interfaces(composite_topology());
        let session = session_for(&device);

        write(&session, &[1]).unwrap();
        assert_eq!(device.writes(), vec![(0x03, vec![1])]);
        assert_eq!(device.claim_calls(), vec![1]);
    }

    #[test]
    fn test_write_short_transfer() {
        let device = keyboard().with_short_writes(2);
        let session = session_for(&device);

        let err = write(&session, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::TransferFailed);
    }

    #[test]
    fn test_set_feature_report_setup() {
        let device = keyboard();
        let session = session_for(&device);

        set_feature_report(&session, &[0x02, 0xaa, 0xbb]).unwrap();

        let controls = device.control_transfers();
        assert_eq!(controls.len(), 1);
        let control = &controls[0];
        assert_eq!(control.setup.request_type, 0x21);
        assert_eq!(control.setup.request, SET_REPORT);
        assert_eq!(control.setup.value, 0x0202);
        assert_eq!(control.setup.index, 0);
        assert_eq!(control.data, vec![0xaa, 0xbb]);
        assert_eq!(control.length, 2);
    }

    #[test]
    fn test_get_feature_report_setup() {
        let device = keyboard().with_feature_report(0x02, vec![0x10, 0x20, 0x30]);
        let session = session_for(&device);

        let data = get_feature_report(&session, &[0x02, 0x00, 0x00]).unwrap();
        assert_eq!(data, vec![0x10, 0x20]);

        let control = &device.control_transfers()[0];
        assert_eq!(control.setup.request_type, 0xa1);
        assert_eq!(control.setup.request, GET_REPORT);
        assert_eq!(control.setup.value, 0x0102);
        assert_eq!(control.length, 2);
    }

    #[test]
    fn test_get_feature_report_is_stable_on_fixed_device() {
        let device = keyboard().with_feature_report(0x05, vec![7, 8, 9]);
        let session = session_for(&device);

        let first = get_feature_report(&session, &[0x05, 0, 0, 0]).unwrap();
        let second = get_feature_report(&session, &[0x05, 0, 0, 0]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_feature_report_windex_is_hid_interface() {
        let device = EmulatedDevice::new("combo", 0x1234, 0x0003)
            .with_interfaces(composite_topology())
            .with_feature_report(0x01, vec![0]);
        let session = session_for(&device);

        get_feature_report(&session, &[0x01, 0]).unwrap();
        assert_eq!(device.control_transfers()[0].setup.index, 2);
        assert_eq!(device.claim_calls(), vec![2]);
    }

    #[test]
    fn test_empty_report_buffer() {
        let device = keyboard();
        let session = session_for(&device);

        let err = set_feature_report(&session, &[]).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::InvalidArgument);
        let err = get_feature_report(&session, &[]).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::InvalidArgument);
        assert!(device.control_transfers().is_empty());
    }

    #[test]
    fn test_feature_report_without_hid_interface() {
        let device = EmulatedDevice::new("bulk", 0x1234, 0x0001).with_interfaces(bulk_only_topology());
        let session = session_for(&device);

        let err = set_feature_report(&session, &[1, 2]).unwrap_err();
        assert_eq!(err, HidError::EndpointNotFound(EndpointKind::HidControl));
    }

    #[test]
    fn test_unknown_feature_report_stalls() {
        let session = session_for(&keyboard());
        let err = get_feature_report(&session, &[0x09, 0]).unwrap_err();
        assert_eq!(err.kind(), HidErrorKind::TransferFailed);
    }

    #[test]
    fn test_transfers_after_close() {
        let device = keyboard().with_input_report(vec![1]);
        let session = session_for(&device);
        session.close().unwrap();

        assert_eq!(
            read(&session, 8, Duration::from_millis(10)).unwrap_err().kind(),
            HidErrorKind::NotOpen
        );
        assert_eq!(write(&session, &[1]).unwrap_err().kind(), HidErrorKind::NotOpen);
        assert_eq!(
            set_feature_report(&session, &[1]).unwrap_err().kind(),
            HidErrorKind::NotOpen
        );
    }

    #[test]
    fn test_topology_is_read_per_operation() {
        let device = EmulatedDevice::new("kbd", 0x1234, 0x5678).with_interfaces(bulk_only_topology());
        let session = session_for(&device);
        assert!(write(&session, &[1]).is_err());

        device.reconfigure(hid_topology());
        write(&session, &[1]).unwrap();
        assert_eq!(device.writes().len(), 1);
    }
}
