//! USB worker thread
//!
//! Dedicated thread owning the device catalog and the session registry.
//! Commands arrive from the Tokio runtime over the bridge; registry changes
//! (open, close, list) are handled in arrival order on this thread, while
//! every transfer runs on its own short-lived thread so a slow read on one
//! device never holds up another device or the command loop. A close leaves
//! the registry at once and drains the session on its own thread too.

use crate::usb::catalog::DeviceCatalog;
use crate::usb::host::UsbHost;
use crate::usb::registry::SessionRegistry;
use crate::usb::session::{DeviceSession, SessionSettings};
use crate::usb::transfers;
use common::channel::Responder;
use async_channel::Sender;
use common::{HidCommand, HidEvent, UsbWorker};
use protocol::{DeviceIdentifier, HidError};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settings the worker needs from the engine configuration
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    /// Device filters (VID:PID patterns)
    pub filters: Vec<String>,
    pub session: SessionSettings,
}

/// USB worker thread
pub struct UsbWorkerThread<U: UsbHost> {
    catalog: DeviceCatalog<U>,
    sessions: SessionRegistry<U>,
    /// Communication channel with Tokio runtime
    worker: UsbWorker,
}

impl<U: UsbHost> UsbWorkerThread<U> {
    pub fn new(worker: UsbWorker, host: Arc<U>, settings: WorkerSettings) -> Self {
        let catalog = DeviceCatalog::new(Arc::clone(&host), settings.filters)
            .with_events(worker.event_tx.clone());
        let sessions = SessionRegistry::new(host, settings.session);

        Self {
            catalog,
            sessions,
            worker,
        }
    }

    /// Run the command loop
    ///
    /// Returns after a Shutdown command or once every bridge handle is gone.
    /// All sessions are closed on the way out.
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            match self.worker.recv_command() {
                Ok(HidCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    info!("Command channel closed, stopping USB worker: {}", e);
                    break;
                }
            }
        }

        for device in self.sessions.open_devices() {
            self.close(&device);
        }
        info!("USB worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: HidCommand) {
        // Wrap in catch_unwind to prevent panics from crashing the USB thread
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_command_inner(cmd)));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: HidCommand) {
        match cmd {
            HidCommand::ListDevices {
                vendor_id,
                product_id,
                response,
            } => {
                let result = self.catalog.list(vendor_id, product_id);
                if let Ok(devices) = &result {
                    debug!("Listing {} devices", devices.len());
                }
                let _ = response.send(result);
            }

            HidCommand::Open { device, response } => {
                let newly_opened = self.sessions.get(&device).is_err();
                let result = self.sessions.open(&device);
                if result.is_ok() && newly_opened {
                    self.publish(HidEvent::SessionOpened { device });
                }
                let _ = response.send(result);
            }

            HidCommand::Read {
                device,
                length,
                timeout_ms,
                response,
            } => {
                let session = match self.sessions.get(&device) {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = response.send(Err(e));
                        return;
                    }
                };
                // 0 selects the configured default
                let timeout = if timeout_ms == 0 {
                    session.timeouts().read
                } else {
                    Duration::from_millis(u64::from(timeout_ms))
                };
                spawn_transfer(session, response, move |s| transfers::read(s, length, timeout));
            }

            HidCommand::Write {
                device,
                data,
                response,
            } => {
                let session = match self.sessions.get(&device) {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = response.send(Err(e));
                        return;
                    }
                };
                spawn_transfer(session, response, move |s| transfers::write(s, &data));
            }

            HidCommand::SetFeatureReport {
                device,
                data,
                response,
            } => {
                let session = match self.sessions.get(&device) {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = response.send(Err(e));
                        return;
                    }
                };
                spawn_transfer(session, response, move |s| {
                    transfers::set_feature_report(s, &data)
                });
            }

            HidCommand::GetFeatureReport {
                device,
                data,
                response,
            } => {
                let session = match self.sessions.get(&device) {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = response.send(Err(e));
                        return;
                    }
                };
                spawn_transfer(session, response, move |s| {
                    transfers::get_feature_report(s, &data)
                });
            }

            HidCommand::Close { device, response } => match self.sessions.remove(&device) {
                Some(session) => spawn_close(session, self.worker.event_tx.clone(), response),
                None => {
                    let _ = response.send(Ok(()));
                }
            },

            HidCommand::Shutdown => {
                // Handled in the main loop
                debug!("Ignoring nested shutdown command");
            }
        }
    }

    /// Close the session on `device` in place, draining its in-flight transfers
    fn close(&mut self, device: &DeviceIdentifier) {
        if self.sessions.close(device) {
            self.publish(HidEvent::SessionClosed {
                device: device.clone(),
            });
        }
    }

    fn publish(&self, event: HidEvent) {
        if let Err(e) = self.worker.send_event(event) {
            debug!("Dropped event: {}", e);
        }
    }
}

/// Drain and close `session` off the worker thread, then answer on `response`
fn spawn_close<H: crate::usb::host::HostHandle>(
    session: Arc<DeviceSession<H>>,
    events: Sender<HidEvent>,
    response: Responder<()>,
) {
    let identifier = session.identifier().clone();

    let spawned = std::thread::Builder::new()
        .name("hid-close".to_string())
        .spawn(move || {
            close_session(&session, &events);
            let _ = response.send(Ok(()));
        });

    // On failure the closure is dropped: the session closes on its last
    // drop and the caller sees the channel close
    if let Err(e) = spawned {
        warn!("Failed to spawn close thread for {}: {}", identifier, e);
    }
}

fn close_session<H: crate::usb::host::HostHandle>(
    session: &DeviceSession<H>,
    events: &Sender<HidEvent>,
) {
    if let Err(e) = session.close() {
        warn!("Error while closing {}: {}", session.identifier(), e);
    }
    let event = HidEvent::SessionClosed {
        device: session.identifier().clone(),
    };
    if let Err(e) = events.try_send(event) {
        debug!("Dropped event: {}", e);
    }
}

/// Run one transfer on its own thread and answer on `response`
fn spawn_transfer<H, T, F>(session: Arc<DeviceSession<H>>, response: Responder<T>, transfer: F)
where
    H: crate::usb::host::HostHandle,
    T: Send + 'static,
    F: FnOnce(&DeviceSession<H>) -> Result<T, HidError> + Send + 'static,
{
    let identifier = session.identifier().clone();

    let spawned = std::thread::Builder::new()
        .name("hid-transfer".to_string())
        .spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| transfer(&session)))
                .unwrap_or_else(|e| {
                    error!("Panic in transfer on {}: {:?}", session.identifier(), e);
                    Err(HidError::TransferFailed("transfer thread panicked".to_string()))
                });
            let _ = response.send(result);
        });

    // The responder is dropped with the closure, so the caller sees the
    // channel close instead of waiting forever
    if let Err(e) = spawned {
        warn!("Failed to spawn transfer thread for {}: {}", identifier, e);
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or every bridge
/// handle is dropped.
pub fn spawn_usb_worker<U: UsbHost>(
    worker: UsbWorker,
    host: Arc<U>,
    settings: WorkerSettings,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(worker, host, settings).run())
}
