//! Open session registry
//!
//! Maps device identifiers to their open [`DeviceSession`]. At most one
//! session exists per identifier; transfers on different devices never share
//! state.

use crate::usb::host::UsbHost;
use crate::usb::session::{DeviceSession, SessionSettings};
use protocol::{DeviceIdentifier, EndpointKind, HidError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SessionRegistry<U: UsbHost> {
    host: Arc<U>,
    sessions: HashMap<DeviceIdentifier, Arc<DeviceSession<U::Handle>>>,
    settings: SessionSettings,
}

impl<U: UsbHost> SessionRegistry<U> {
    pub fn new(host: Arc<U>, settings: SessionSettings) -> Self {
        Self {
            host,
            sessions: HashMap::new(),
            settings,
        }
    }

    /// Open a session on `identifier`
    ///
    /// Opening a device that already has a session succeeds without touching
    /// the hardware again.
    pub fn open(&mut self, identifier: &DeviceIdentifier) -> Result<bool, HidError> {
        if let Some(session) = self.sessions.get(identifier) {
            if session.is_open() {
                debug!("Device {} already open", identifier);
                return Ok(true);
            }
            self.sessions.remove(identifier);
        }

        let session = DeviceSession::open(
            self.host.as_ref(),
            identifier.clone(),
            self.settings.timeouts,
        )?;

        if self.settings.claim_on_open {
            if let Err(e) = session.claim_endpoints(&[EndpointKind::Read, EndpointKind::Write]) {
                if let Err(close_err) = session.close() {
                    debug!("Error closing {} after failed claim: {}", identifier, close_err);
                }
                return Err(e);
            }
        }

        self.sessions.insert(identifier.clone(), Arc::new(session));
        info!("Session opened on {} ({} open)", identifier, self.sessions.len());
        Ok(true)
    }

    /// Session for `identifier`, shared with in-flight transfers
    pub fn get(&self, identifier: &DeviceIdentifier) -> Result<Arc<DeviceSession<U::Handle>>, HidError> {
        self.sessions
            .get(identifier)
            .filter(|session| session.is_open())
            .cloned()
            .ok_or_else(|| HidError::NotOpen(identifier.clone()))
    }

    /// Close and forget the session on `identifier`
    ///
    /// Returns false when no session was open. Release failures are logged
    /// and do not keep the session alive.
    pub fn close(&mut self, identifier: &DeviceIdentifier) -> bool {
        let Some(session) = self.remove(identifier) else {
            return false;
        };

        if let Err(e) = session.close() {
            warn!("Error while closing {}: {}", identifier, e);
        }
        true
    }

    /// Forget the session on `identifier` without closing it
    ///
    /// The caller owns the close; until then transfers already holding the
    /// session keep running, while new commands see `NotOpen`.
    pub fn remove(
        &mut self,
        identifier: &DeviceIdentifier,
    ) -> Option<Arc<DeviceSession<U::Handle>>> {
        let session = self.sessions.remove(identifier);
        if session.is_none() {
            debug!("Close on {} with no open session", identifier);
        }
        session
    }

    /// Close every open session
    pub fn close_all(&mut self) {
        let identifiers: Vec<_> = self.sessions.keys().cloned().collect();
        for identifier in identifiers {
            self.close(&identifier);
        }
    }

    /// Identifiers with an open session, sorted
    pub fn open_devices(&self) -> Vec<DeviceIdentifier> {
        let mut devices: Vec<_> = self.sessions.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
