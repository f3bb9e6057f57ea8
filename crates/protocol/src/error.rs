//! HID transport error types

use crate::types::{DeviceIdentifier, EndpointKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported for a single engine call
///
/// Every call resolves with a value or exactly one of these. None of them is
/// retried by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HidError {
    /// Unknown identifier, or the host refused to hand out a handle
    /// (often: permission not granted yet)
    #[error("Device {identifier} unavailable: {message}")]
    DeviceUnavailable {
        identifier: DeviceIdentifier,
        message: String,
    },

    /// The host denied an exclusive claim on an interface
    #[error("Failed to claim interface {interface}: {message}")]
    InterfaceClaimFailed { interface: u8, message: String },

    /// The device topology has no endpoint for the requested operation
    #[error("No {0} endpoint found")]
    EndpointNotFound(EndpointKind),

    /// No open session for the device
    #[error("Device {0} is not open")]
    NotOpen(DeviceIdentifier),

    /// Malformed call arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Host-layer I/O failure during an otherwise valid transfer
    #[error("Transfer failed: {0}")]
    TransferFailed(String),
}

/// Error kind, the first half of the `(kind, message)` pair seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HidErrorKind {
    DeviceUnavailable,
    InterfaceClaimFailed,
    EndpointNotFound,
    NotOpen,
    InvalidArgument,
    TransferFailed,
}

impl HidErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HidErrorKind::DeviceUnavailable => "DeviceUnavailable",
            HidErrorKind::InterfaceClaimFailed => "InterfaceClaimFailed",
            HidErrorKind::EndpointNotFound => "EndpointNotFound",
            HidErrorKind::NotOpen => "NotOpen",
            HidErrorKind::InvalidArgument => "InvalidArgument",
            HidErrorKind::TransferFailed => "TransferFailed",
        }
    }
}

impl fmt::Display for HidErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HidError {
    pub fn kind(&self) -> HidErrorKind {
        match self {
            HidError::DeviceUnavailable { .. } => HidErrorKind::DeviceUnavailable,
            HidError::InterfaceClaimFailed { .. } => HidErrorKind::InterfaceClaimFailed,
            HidError::EndpointNotFound(_) => HidErrorKind::EndpointNotFound,
            HidError::NotOpen(_) => HidErrorKind::NotOpen,
            HidError::InvalidArgument(_) => HidErrorKind::InvalidArgument,
            HidError::TransferFailed(_) => HidErrorKind::TransferFailed,
        }
    }

    pub fn device_unavailable(identifier: &DeviceIdentifier, message: impl Into<String>) -> Self {
        HidError::DeviceUnavailable {
            identifier: identifier.clone(),
            message: message.into(),
        }
    }
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, HidError>;
