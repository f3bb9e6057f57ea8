//! Async channel bridge between Tokio runtime and USB thread
//!
//! Every command carries its own oneshot sender, so each call resolves
//! exactly once and the async caller never blocks on USB I/O.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceDescriptor, DeviceIdentifier, HidError};
use tokio::sync::oneshot;

/// Response channel for one command
pub type Responder<T> = oneshot::Sender<Result<T, HidError>>;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum HidCommand {
    /// List attached devices, optionally filtered by vendor/product id
    ListDevices {
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        /// Channel to send response back
        response: Responder<Vec<DeviceDescriptor>>,
    },

    /// Open a session on a device
    Open {
        device: DeviceIdentifier,
        response: Responder<bool>,
    },

    /// Interrupt IN read of up to `length` bytes
    Read {
        device: DeviceIdentifier,
        length: usize,
        timeout_ms: u32,
        response: Responder<Vec<u8>>,
    },

    /// Interrupt OUT write of the whole buffer
    Write {
        device: DeviceIdentifier,
        data: Vec<u8>,
        response: Responder<()>,
    },

    /// HID SET_REPORT; `data[0]` is the report id
    SetFeatureReport {
        device: DeviceIdentifier,
        data: Vec<u8>,
        response: Responder<()>,
    },

    /// HID GET_REPORT; `data[0]` is the report id, `data.len() - 1` the length
    GetFeatureReport {
        device: DeviceIdentifier,
        data: Vec<u8>,
        response: Responder<Vec<u8>>,
    },

    /// Close the session on a device
    Close {
        device: DeviceIdentifier,
        response: Responder<()>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Events published by the USB thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidEvent {
    /// A device was skipped during enumeration and access was requested
    PermissionRequested { device: DeviceIdentifier },

    /// A session was opened
    SessionOpened { device: DeviceIdentifier },

    /// A session was closed
    SessionClosed { device: DeviceIdentifier },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<HidCommand>,
    event_rx: Receiver<HidEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: HidCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<HidEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event if one is queued
    pub fn try_recv_event(&self) -> Option<HidEvent> {
        self.event_rx.try_recv().ok()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> HidCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx)).await?;
        let result = rx
            .await
            .map_err(|_| crate::Error::Channel("USB worker dropped the request".to_string()))?;
        Ok(result?)
    }

    pub async fn list_devices(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> crate::Result<Vec<DeviceDescriptor>> {
        self.request(|response| HidCommand::ListDevices {
            vendor_id,
            product_id,
            response,
        })
        .await
    }

    pub async fn open(&self, device: &DeviceIdentifier) -> crate::Result<bool> {
        let device = device.clone();
        self.request(|response| HidCommand::Open { device, response })
            .await
    }

    pub async fn read(
        &self,
        device: &DeviceIdentifier,
        length: usize,
        timeout_ms: u32,
    ) -> crate::Result<Vec<u8>> {
        let device = device.clone();
        self.request(|response| HidCommand::Read {
            device,
            length,
            timeout_ms,
            response,
        })
        .await
    }

    pub async fn write(&self, device: &DeviceIdentifier, data: Vec<u8>) -> crate::Result<()> {
        let device = device.clone();
        self.request(|response| HidCommand::Write {
            device,
            data,
            response,
        })
        .await
    }

    pub async fn set_feature_report(
        &self,
        device: &DeviceIdentifier,
        data: Vec<u8>,
    ) -> crate::Result<()> {
        let device = device.clone();
        self.request(|response| HidCommand::SetFeatureReport {
            device,
            data,
            response,
        })
        .await
    }

    pub async fn get_feature_report(
        &self,
        device: &DeviceIdentifier,
        data: Vec<u8>,
    ) -> crate::Result<Vec<u8>> {
        let device = device.clone();
        self.request(|response| HidCommand::GetFeatureReport {
            device,
            data,
            response,
        })
        .await
    }

    pub async fn close(&self, device: &DeviceIdentifier) -> crate::Result<()> {
        let device = device.clone();
        self.request(|response| HidCommand::Close { device, response })
            .await
    }

    /// Ask the USB thread to close all sessions and stop
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(HidCommand::Shutdown).await
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<HidCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<HidEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<HidCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<HidCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Publish an event without blocking
    ///
    /// Events are dropped when nobody drains the queue.
    pub fn send_event(&self, event: HidEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
