//! Device session
//!
//! A session is the exclusive owner of one open device handle. It tracks the
//! interfaces it has claimed and coordinates concurrent transfers with
//! `close`:
//!
//! - transfers and claims hold a read guard on the handle while they run;
//! - claims are serialized by the claimed-set lock, never by the handle;
//! - only `close` takes the write guard, after raising the closing flag so
//!   new transfers are rejected while the in-flight ones drain.

use crate::usb::host::{HostHandle, UsbHost};
use crate::usb::locator::{self, ResolvedEndpoint};
use crate::usb::transfers::map_rusb_error;
use protocol::{DeviceIdentifier, EndpointKind, HidError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for writes and control transfers (1 second)
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeouts applied by the transfer primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeouts {
    /// Used for reads that do not specify a timeout
    pub read: Duration,
    pub write: Duration,
    pub control: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            read: DEFAULT_TRANSFER_TIMEOUT,
            write: DEFAULT_TRANSFER_TIMEOUT,
            control: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

/// How sessions are opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub timeouts: TransferTimeouts,
    /// Claim the read and write interfaces at open time instead of on first use
    pub claim_on_open: bool,
}

/// Exclusive session on one open device
pub struct DeviceSession<H: HostHandle> {
    identifier: DeviceIdentifier,
    /// `None` once closed
    handle: RwLock<Option<H>>,
    /// Interface numbers claimed by this session
    claimed: Mutex<BTreeSet<u8>>,
    closing: AtomicBool,
    timeouts: TransferTimeouts,
}

impl<H: HostHandle> DeviceSession<H> {
    /// Open the device through the host layer
    ///
    /// No interface is claimed here.
    pub fn open<U>(
        host: &U,
        identifier: DeviceIdentifier,
        timeouts: TransferTimeouts,
    ) -> Result<Self, HidError>
    where
        U: UsbHost<Handle = H>,
    {
        let handle = host.open(&identifier).map_err(|e| {
            warn!("Failed to open device {}: {}", identifier, e);
            HidError::device_unavailable(&identifier, e.to_string())
        })?;

        info!("Opened device {}", identifier);
        Ok(Self::from_handle(identifier, handle, timeouts))
    }

    /// Wrap an already open handle
    pub fn from_handle(identifier: DeviceIdentifier, handle: H, timeouts: TransferTimeouts) -> Self {
        Self {
            identifier,
            handle: RwLock::new(Some(handle)),
            claimed: Mutex::new(BTreeSet::new()),
            closing: AtomicBool::new(false),
            timeouts,
        }
    }

    pub fn identifier(&self) -> &DeviceIdentifier {
        &self.identifier
    }

    pub fn timeouts(&self) -> TransferTimeouts {
        self.timeouts
    }

    /// Check if the session still accepts transfers
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && self.read_handle().is_some()
    }

    /// Interface numbers currently claimed, ascending
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.claimed_set().iter().copied().collect()
    }

    /// Run `f` against the open handle
    ///
    /// The read guard is held until `f` returns, which keeps `close` from
    /// releasing the handle underneath a running transfer.
    pub fn with_handle<T>(&self, f: impl FnOnce(&H) -> Result<T, HidError>) -> Result<T, HidError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(self.not_open());
        }

        let guard = self.read_handle();
        let handle = guard.as_ref().ok_or_else(|| self.not_open())?;
        f(handle)
    }

    /// Resolve the endpoint for `kind` against the live configuration
    pub fn locate(&self, kind: EndpointKind) -> Result<ResolvedEndpoint, HidError> {
        self.with_handle(|handle| {
            let interfaces = handle.interfaces().map_err(|e| {
                warn!(
                    "Failed to read active configuration of {}: {}",
                    self.identifier, e
                );
                map_rusb_error(e)
            })?;
            locator::locate(kind, &interfaces)
        })
    }

    /// Claim `interface` unless this session already holds it
    ///
    /// Concurrent first use results in exactly one host claim; every caller
    /// sees success once it went through. Transfers already running on other
    /// interfaces are not waited for.
    pub fn ensure_claimed(&self, interface: u8) -> Result<(), HidError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(self.not_open());
        }
        if self.claimed_set().contains(&interface) {
            return Ok(());
        }

        let guard = self.read_handle();
        let handle = guard.as_ref().ok_or_else(|| self.not_open())?;

        // Held across the host claim; another caller may have won meanwhile
        let mut claimed = self.claimed_set();
        if claimed.contains(&interface) {
            return Ok(());
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!(
                "Failed to claim interface {} on {}: {}",
                interface, self.identifier, e
            );
            HidError::InterfaceClaimFailed {
                interface,
                message: e.to_string(),
            }
        })?;

        claimed.insert(interface);
        debug!("Claimed interface {} on device {}", interface, self.identifier);
        Ok(())
    }

    /// Claim the interfaces owning the given endpoints
    ///
    /// Missing endpoints are skipped; the transfer needing them reports
    /// `EndpointNotFound` later.
    pub fn claim_endpoints(&self, kinds: &[EndpointKind]) -> Result<(), HidError> {
        for &kind in kinds {
            match self.locate(kind) {
                Ok(endpoint) => self.ensure_claimed(endpoint.interface)?,
                Err(HidError::EndpointNotFound(_)) => {
                    debug!("No {} endpoint on {}, not claiming", kind, self.identifier);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close the session
    ///
    /// Waits for in-flight transfers, releases every claimed interface and
    /// drops the handle. Returns the first release failure; the handle is
    /// gone either way. Closing a closed session does nothing.
    pub fn close(&self) -> Result<(), HidError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("Device {} already closed", self.identifier);
            return Ok(());
        }

        let mut guard = self.write_handle();
        let Some(handle) = guard.take() else {
            return Ok(());
        };

        let claimed = std::mem::take(&mut *self.claimed_set());
        let mut result = Ok(());
        for interface in claimed {
            if let Err(e) = handle.release_interface(interface) {
                warn!(
                    "Failed to release interface {} on {}: {}",
                    interface, self.identifier, e
                );
                if result.is_ok() {
                    result = Err(HidError::TransferFailed(format!(
                        "Failed to release interface {}: {}",
                        interface, e
                    )));
                }
            }
        }
        drop(handle);

        info!("Closed device {}", self.identifier);
        result
    }

    fn not_open(&self) -> HidError {
        HidError::NotOpen(self.identifier.clone())
    }

    fn read_handle(&self) -> RwLockReadGuard<'_, Option<H>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handle(&self) -> RwLockWriteGuard<'_, Option<H>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn claimed_set(&self) -> MutexGuard<'_, BTreeSet<u8>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: HostHandle> Drop for DeviceSession<H> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error closing {} on drop: {}", self.identifier, e);
        }
    }
}
