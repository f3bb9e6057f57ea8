//! Test utilities for hid-transport
//!
//! Provides mock descriptors, canned device topologies and helper functions
//! for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_descriptor;
//!
//! let device = create_mock_descriptor(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! ```

use protocol::{
    DeviceDescriptor, DeviceIdentifier, EndpointInfo, HID_INTERFACE_CLASS, InterfaceInfo,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor-specific interface class
pub const VENDOR_INTERFACE_CLASS: u8 = 0xff;

/// Create a mock DeviceDescriptor for testing
///
/// # Arguments
/// * `id` - Device number, used for the bus address and strings
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_descriptor(id: u8, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        serial_number: format!("SN{:06}", id),
        product_name: format!("Test Product {}", id),
        identifier: DeviceIdentifier::from_bus_address(1, id),
    }
}

/// Create a list of mock descriptors for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_descriptor_list;
///
/// let devices = create_mock_descriptor_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_descriptor_list(count: u8) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_descriptor(i, 0x1000 + u16::from(i), 0x2000 + u16::from(i)))
        .collect()
}

/// Single HID interface with interrupt IN 0x81 and interrupt OUT 0x01
pub fn hid_topology() -> Vec<InterfaceInfo> {
    vec![InterfaceInfo::new(
        0,
        HID_INTERFACE_CLASS,
        vec![EndpointInfo::interrupt(0x81), EndpointInfo::interrupt(0x01)],
    )]
}

/// Composite device: a vendor interface with bulk endpoints, a vendor
/// interface with an interrupt OUT, then the HID interface
///
/// Read resolves to interface 2, write to interface 1, HID control to
/// interface 2.
pub fn composite_topology() -> Vec<InterfaceInfo> {
    vec![
        InterfaceInfo::new(
            0,
            VENDOR_INTERFACE_CLASS,
            vec![EndpointInfo::bulk(0x82), EndpointInfo::bulk(0x02)],
        ),
        InterfaceInfo::new(1, VENDOR_INTERFACE_CLASS, vec![EndpointInfo::interrupt(0x03)]),
        InterfaceInfo::new(
            2,
            HID_INTERFACE_CLASS,
            vec![EndpointInfo::interrupt(0x84), EndpointInfo::interrupt(0x04)],
        ),
    ]
}

/// Device without any interrupt endpoint
pub fn bulk_only_topology() -> Vec<InterfaceInfo> {
    vec![InterfaceInfo::new(
        0,
        VENDOR_INTERFACE_CLASS,
        vec![EndpointInfo::bulk(0x81), EndpointInfo::bulk(0x01)],
    )]
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create an HID report buffer: report id followed by `payload`
pub fn create_report(report_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut report = Vec::with_capacity(payload.len() + 1);
    report.push(report_id);
    report.extend_from_slice(payload);
    report
}
