//! Endpoint discovery
//!
//! Pure functions over the interface list of the active configuration.
//! Interfaces are scanned in ascending order, endpoints in ascending order
//! within each interface, and the first endpoint satisfying the predicate
//! wins. Devices exposing several candidates always resolve to the same one.

use protocol::{
    EndpointDirection, EndpointInfo, EndpointKind, EndpointTransfer, HID_INTERFACE_CLASS,
    HidError, InterfaceEndpointRef, InterfaceInfo,
};

/// An endpoint reference resolved against a live topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub location: InterfaceEndpointRef,
    /// bInterfaceNumber of the owning interface
    pub interface: u8,
    /// Endpoint address (includes direction bit)
    pub address: u8,
}

/// First interrupt IN endpoint
pub fn find_read(interfaces: &[InterfaceInfo]) -> Option<InterfaceEndpointRef> {
    find_first(interfaces, |_, endpoint| {
        is_interrupt(endpoint, EndpointDirection::In)
    })
}

/// First interrupt OUT endpoint
pub fn find_write(interfaces: &[InterfaceInfo]) -> Option<InterfaceEndpointRef> {
    find_first(interfaces, |_, endpoint| {
        is_interrupt(endpoint, EndpointDirection::Out)
    })
}

/// First interrupt IN endpoint of an HID-class interface
///
/// Only the interface part is used, as `wIndex` of class control transfers.
pub fn find_hid_control(interfaces: &[InterfaceInfo]) -> Option<InterfaceEndpointRef> {
    find_first(interfaces, |interface, endpoint| {
        interface.class_code == HID_INTERFACE_CLASS
            && is_interrupt(endpoint, EndpointDirection::In)
    })
}

pub fn find(kind: EndpointKind, interfaces: &[InterfaceInfo]) -> Option<InterfaceEndpointRef> {
    match kind {
        EndpointKind::Read => find_read(interfaces),
        EndpointKind::Write => find_write(interfaces),
        EndpointKind::HidControl => find_hid_control(interfaces),
    }
}

/// Find the endpoint for `kind` and resolve it to interface number and address
pub fn locate(kind: EndpointKind, interfaces: &[InterfaceInfo]) -> Result<ResolvedEndpoint, HidError> {
    let location = find(kind, interfaces).ok_or(HidError::EndpointNotFound(kind))?;
    let interface = &interfaces[location.interface_index];
    let endpoint = &interface.endpoints[location.endpoint_index];

    Ok(ResolvedEndpoint {
        location,
        interface: interface.number,
        address: endpoint.address,
    })
}

fn is_interrupt(endpoint: &EndpointInfo, direction: EndpointDirection) -> bool {
    endpoint.transfer_type == EndpointTransfer::Interrupt && endpoint.direction == direction
}

fn find_first(
    interfaces: &[InterfaceInfo],
    predicate: impl Fn(&InterfaceInfo, &EndpointInfo) -> bool,
) -> Option<InterfaceEndpointRef> {
    interfaces
        .iter()
        .enumerate()
        .find_map(|(interface_index, interface)| {
            interface
                .endpoints
                .iter()
                .position(|endpoint| predicate(interface, endpoint))
                .map(|endpoint_index| InterfaceEndpointRef::new(interface_index, endpoint_index))
        })
}
