//! HID Transport Integration Tests
//!
//! Drives the full stack (bridge, worker thread, registry, sessions,
//! transfers) against the emulated host.
//!
//! # Test Scenarios
//! - Enumeration with id filters and permission handling
//! - Session lifecycle and events
//! - Interrupt and feature report transfers
//! - Concurrent transfers and close draining
//!
//! Run with: `cargo test -p engine --test transport_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, composite_topology, create_report, hid_topology, with_timeout,
};
use common::{HidEvent, UsbBridge, create_usb_bridge};
use engine::usb::{
    EmulatedDevice, EmulatedHost, SessionSettings, TransferTimeouts, WorkerSettings,
    spawn_usb_worker,
};
use protocol::{DeviceIdentifier, EndpointKind, HidError, HidErrorKind, REPORT_TYPE_OUTPUT};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Harness {
    bridge: UsbBridge,
    host: EmulatedHost,
    worker: Option<JoinHandle<()>>,
}

impl Harness {
    fn new(devices: &[EmulatedDevice]) -> Self {
        Self::with_settings(devices, WorkerSettings::default())
    }

    fn with_settings(devices: &[EmulatedDevice], settings: WorkerSettings) -> Self {
        let host = EmulatedHost::new();
        for device in devices {
            host.add_device(device.clone());
        }

        let (bridge, worker) = create_usb_bridge();
        let worker = spawn_usb_worker(worker, Arc::new(host.clone()), settings).unwrap();

        Self {
            bridge,
            host,
            worker: Some(worker),
        }
    }

    async fn shutdown(mut self) {
        self.bridge.shutdown().await.unwrap();
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}

fn keyboard(address: u8) -> EmulatedDevice {
    EmulatedDevice::new(DeviceIdentifier::from_bus_address(1, address), 0x1234, 0x5678)
        .with_interfaces(hid_topology())
        .with_strings("Test Keyboard", "KB-0001")
}

fn hid_kind<T: std::fmt::Debug>(result: common::Result<T>) -> HidErrorKind {
    result.unwrap_err().hid_kind().unwrap()
}

// ============================================================================
// Enumeration Tests
// ============================================================================

#[tokio::test]
async fn test_list_devices() {
    let harness = Harness::new(&[keyboard(2), keyboard(3)]);

    let devices = harness.bridge.list_devices(None, None).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].product_name, "Test Keyboard");
    assert_eq!(devices[0].serial_number, "KB-0001");
    assert_eq!(devices[1], *keyboard(3).descriptor());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_list_by_vendor_excludes_others() {
    let other = EmulatedDevice::new("001/009", 0x9999, 0x0001);
    let harness = Harness::new(&[keyboard(2), other]);

    let devices = harness.bridge.list_devices(Some(0x1234), None).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(devices.iter().all(|d| d.vendor_id == 0x1234));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_list_with_configured_filters() {
    let other = EmulatedDevice::new("001/009", 0x9999, 0x0001);
    let settings = WorkerSettings {
        filters: vec!["0x9999:*".to_string()],
        ..Default::default()
    };
    let harness = Harness::with_settings(&[keyboard(2), other], settings);

    let devices = harness.bridge.list_devices(None, None).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].vendor_id, 0x9999);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_permission_denied_device_is_skipped() {
    let locked = keyboard(5).without_permission();
    let harness = Harness::new(&[keyboard(2), locked.clone()]);

    let devices = harness.bridge.list_devices(None, None).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(harness.host.permission_requests(), vec![locked.identifier().clone()]);

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, harness.bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        HidEvent::PermissionRequested {
            device: locked.identifier().clone()
        }
    );

    // Listed on the next pass once granted
    harness.host.grant_permission(locked.identifier());
    assert_eq!(harness.bridge.list_devices(None, None).await.unwrap().len(), 2);

    harness.shutdown().await;
}

// ============================================================================
// Session Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_read_before_open() {
    let device = keyboard(2).with_input_report(vec![1, 2, 3]);
    let harness = Harness::new(&[device.clone()]);

    let result = harness.bridge.read(device.identifier(), 8, 10).await;
    assert_eq!(hid_kind(result), HidErrorKind::NotOpen);
    assert_eq!(device.pending_input_reports(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_open_unknown_device() {
    let harness = Harness::new(&[]);

    let result = harness.bridge.open(&"003/001".into()).await;
    assert_eq!(hid_kind(result), HidErrorKind::DeviceUnavailable);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_open_publishes_events() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone()]);

    assert!(harness.bridge.open(device.identifier()).await.unwrap());
    // Second open reuses the session without a second event
    assert!(harness.bridge.open(device.identifier()).await.unwrap());
    harness.bridge.close(device.identifier()).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = harness.bridge.try_recv_event() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            HidEvent::SessionOpened {
                device: device.identifier().clone()
            },
            HidEvent::SessionClosed {
                device: device.identifier().clone()
            },
        ]
    );
    assert_eq!(device.open_handles(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_twice() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    harness.bridge.write(device.identifier(), vec![1]).await.unwrap();

    harness.bridge.close(device.identifier()).await.unwrap();
    harness.bridge.close(device.identifier()).await.unwrap();

    assert_eq!(device.release_calls(), vec![0]);
    assert_eq!(device.open_handles(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_with_failing_release_succeeds() {
    let device = keyboard(2).failing_release();
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    harness.bridge.write(device.identifier(), vec![1]).await.unwrap();
    harness.bridge.close(device.identifier()).await.unwrap();

    let result = harness.bridge.write(device.identifier(), vec![1]).await;
    assert_eq!(hid_kind(result), HidErrorKind::NotOpen);
    assert_eq!(device.open_handles(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reopen_after_close() {
    let device = keyboard(2).with_input_report(vec![7]);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    harness.bridge.close(device.identifier()).await.unwrap();
    harness.bridge.open(device.identifier()).await.unwrap();

    let data = harness.bridge.read(device.identifier(), 8, 10).await.unwrap();
    assert_eq!(data, vec![7]);
    assert_eq!(device.claim_calls(), vec![0]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_eager_claim_on_open() {
    let device = EmulatedDevice::new("001/002", 0x1234, 0x0003).with_interfaces(composite_topology());
    let settings = WorkerSettings {
        filters: vec![],
        session: SessionSettings {
            claim_on_open: true,
            ..Default::default()
        },
    };
    let harness = Harness::with_settings(&[device.clone()], settings);

    harness.bridge.open(device.identifier()).await.unwrap();
    assert_eq!(device.claim_calls(), vec![2, 1]);

    // Already claimed, no further host claims
    harness.bridge.write(device.identifier(), vec![1]).await.unwrap();
    assert_eq!(device.claim_calls(), vec![2, 1]);

    harness.shutdown().await;
}

// ============================================================================
// Transfer Tests
// ============================================================================

#[tokio::test]
async fn test_read_input_report() {
    let device = keyboard(2).with_input_report(vec![0x01, 0x00, 0x04]);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    let data = harness.bridge.read(device.identifier(), 64, 100).await.unwrap();
    assert_eq!(data, vec![0x01, 0x00, 0x04]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_read_timeout_is_empty_success() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    let data = harness.bridge.read(device.identifier(), 8, 10).await.unwrap();
    assert!(data.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_read_zero_length() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    let result = harness.bridge.read(device.identifier(), 0, 10).await;
    assert_eq!(hid_kind(result), HidErrorKind::InvalidArgument);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_write_output_report() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    harness
        .bridge
        .write(device.identifier(), create_report(0x01, &[0xaa, 0xbb]))
        .await
        .unwrap();
    assert_eq!(device.writes(), vec![(0x01, vec![0x01, 0xaa, 0xbb])]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_claim_failure_is_reported() {
    let device = keyboard(2).deny_claim(0);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    let err = harness
        .bridge
        .write(device.identifier(), vec![1])
        .await
        .unwrap_err();
    assert_eq!(err.hid_kind(), Some(HidErrorKind::InterfaceClaimFailed));
    assert!(device.writes().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_missing_endpoint_is_reported() {
    let device = EmulatedDevice::new("001/002", 0x1234, 0x0001);
    let harness = Harness::new(&[device.clone()]);

    harness.bridge.open(device.identifier()).await.unwrap();
    let err = harness.bridge.read(device.identifier(), 8, 10).await.unwrap_err();
    assert!(matches!(
        err,
        common::Error::Hid(HidError::EndpointNotFound(EndpointKind::Read))
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_feature_report_round_trip() {
    let device = keyboard(2).with_feature_report(0x02, vec![0x10, 0x20, 0x30, 0x40]);
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    harness
        .bridge
        .set_feature_report(device.identifier(), vec![0x02, 0xaa, 0xbb])
        .await
        .unwrap();
    let report = harness
        .bridge
        .get_feature_report(device.identifier(), vec![0x02, 0x00, 0x00])
        .await
        .unwrap();
    assert_eq!(report, vec![0x10, 0x20]);

    let controls = device.control_transfers();
    assert_eq!(controls.len(), 2);
    assert_eq!(controls[0].setup.value, REPORT_TYPE_OUTPUT | 0x02);
    assert_eq!(controls[0].data, vec![0xaa, 0xbb]);
    assert_eq!(controls[1].setup.value, 0x0102);
    assert_eq!(controls[1].length, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_get_feature_report_is_repeatable() {
    let device = keyboard(2).with_feature_report(0x03, vec![1, 2, 3, 4]);
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    let first = harness
        .bridge
        .get_feature_report(device.identifier(), vec![0x03, 0, 0, 0])
        .await
        .unwrap();
    let second = harness
        .bridge
        .get_feature_report(device.identifier(), vec![0x03, 0, 0, 0])
        .await
        .unwrap();
    assert_eq!(first, second);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_host_failure_maps_to_transfer_failed() {
    let device = keyboard(2).failing_transfers(rusb::Error::NoDevice);
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    let result = harness.bridge.write(device.identifier(), vec![1]).await;
    assert_eq!(hid_kind(result), HidErrorKind::TransferFailed);
    let result = harness
        .bridge
        .get_feature_report(device.identifier(), vec![1, 0])
        .await;
    assert_eq!(hid_kind(result), HidErrorKind::TransferFailed);

    harness.shutdown().await;
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_read_and_write() {
    let device = keyboard(2)
        .with_input_report(vec![5, 6])
        .with_read_delay(Duration::from_millis(50));
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    let (read, write) = tokio::join!(
        harness.bridge.read(device.identifier(), 8, 500),
        harness.bridge.write(device.identifier(), vec![9]),
    );
    assert_eq!(read.unwrap(), vec![5, 6]);
    write.unwrap();

    // Both transfers live on interface 0, claimed exactly once
    assert_eq!(device.claim_calls(), vec![0]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_transfers_on_different_devices() {
    let first = keyboard(2).with_input_report(vec![1]);
    let second = keyboard(3).with_input_report(vec![2]);
    let harness = Harness::new(&[first.clone(), second.clone()]);

    harness.bridge.open(first.identifier()).await.unwrap();
    harness.bridge.open(second.identifier()).await.unwrap();

    let (a, b) = tokio::join!(
        harness.bridge.read(first.identifier(), 8, 100),
        harness.bridge.read(second.identifier(), 8, 100),
    );
    assert_eq!(a.unwrap(), vec![1]);
    assert_eq!(b.unwrap(), vec![2]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_drains_in_flight_read() {
    let device = keyboard(2)
        .with_input_report(vec![0x42])
        .with_read_delay(Duration::from_millis(100));
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    let bridge = harness.bridge.clone();
    let id = device.identifier().clone();
    let read = tokio::spawn(async move { bridge.read(&id, 8, 500).await });

    // Let the read claim its interface and start waiting
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.bridge.close(device.identifier()).await.unwrap();

    assert_eq!(read.await.unwrap().unwrap(), vec![0x42]);
    assert_eq!(device.open_handles(), 0);
    assert_eq!(device.release_calls(), vec![0]);

    let result = harness.bridge.read(device.identifier(), 8, 10).await;
    assert_eq!(hid_kind(result), HidErrorKind::NotOpen);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_first_claim_does_not_wait_for_read_on_other_interface() {
    let device = EmulatedDevice::new("001/002", 0x1234, 0x0003)
        .with_interfaces(composite_topology())
        .with_input_report(vec![0x11])
        .with_read_delay(Duration::from_millis(800));
    let harness = Harness::new(&[device.clone()]);
    harness.bridge.open(device.identifier()).await.unwrap();

    // Read resolves to interface 2, write to interface 1
    let bridge = harness.bridge.clone();
    let id = device.identifier().clone();
    let read = tokio::spawn(async move { bridge.read(&id, 8, 2000).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    with_timeout(
        Duration::from_millis(300),
        harness.bridge.write(device.identifier(), vec![0x22]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(device.writes(), vec![(0x03, vec![0x22])]);

    assert_eq!(read.await.unwrap().unwrap(), vec![0x11]);
    assert_eq!(device.claim_calls(), vec![2, 1]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_does_not_block_other_devices() {
    let slow = keyboard(2)
        .with_input_report(vec![1])
        .with_read_delay(Duration::from_millis(800));
    let fast = keyboard(3).with_input_report(vec![2]);
    let harness = Harness::new(&[slow.clone(), fast.clone()]);
    harness.bridge.open(slow.identifier()).await.unwrap();
    harness.bridge.open(fast.identifier()).await.unwrap();

    let bridge = harness.bridge.clone();
    let id = slow.identifier().clone();
    let read = tokio::spawn(async move { bridge.read(&id, 8, 2000).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bridge = harness.bridge.clone();
    let id = slow.identifier().clone();
    let close = tokio::spawn(async move { bridge.close(&id).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The slow device is still draining; the other one answers at once
    let data = with_timeout(
        Duration::from_millis(300),
        harness.bridge.read(fast.identifier(), 8, 100),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(data, vec![2]);
    assert_eq!(slow.open_handles(), 1);

    close.await.unwrap().unwrap();
    assert_eq!(read.await.unwrap().unwrap(), vec![1]);
    assert_eq!(slow.open_handles(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unplugged_device_keeps_open_session() {
    let device = keyboard(2);
    let harness = Harness::new(&[device.clone(), keyboard(3)]);
    harness.bridge.open(device.identifier()).await.unwrap();

    harness.host.remove_device(device.identifier());
    let devices = harness.bridge.list_devices(None, None).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_ne!(&devices[0].identifier, device.identifier());

    // The open handle still reaches the device it was opened on
    device.push_input_report(vec![0x33]);
    let data = harness.bridge.read(device.identifier(), 8, 100).await.unwrap();
    assert_eq!(data, vec![0x33]);

    harness.bridge.close(device.identifier()).await.unwrap();
    assert_eq!(device.open_handles(), 0);

    // Gone from the host, so it cannot be opened again
    let result = harness.bridge.open(device.identifier()).await;
    assert_eq!(hid_kind(result), HidErrorKind::DeviceUnavailable);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_default_read_timeout() {
    let device = keyboard(2).with_read_delay(Duration::from_millis(500));
    let settings = WorkerSettings {
        filters: vec![],
        session: SessionSettings {
            timeouts: TransferTimeouts {
                read: Duration::from_millis(20),
                ..Default::default()
            },
            claim_on_open: false,
        },
    };
    let harness = Harness::with_settings(&[device.clone()], settings);
    harness.bridge.open(device.identifier()).await.unwrap();

    // The emulated read waits no longer than the timeout it is given
    let data = with_timeout(
        Duration::from_millis(400),
        harness.bridge.read(device.identifier(), 8, 0),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(data.is_empty());

    harness.shutdown().await;
}
