//! Async channel bridge between the Tokio runtime and the USB worker thread
//!
//! USB operations are blocking (libusb), so they run on a dedicated OS
//! thread. Connection tasks submit commands over a bounded channel, each
//! carrying a oneshot sender the worker answers on; device hotplug events
//! flow the other way.

use crate::usb_types::{DeviceRecord, OpenError, UrbOutcome};
use async_channel::{Receiver, Sender, bounded};
use protocol::{BusId, SubmitCmd};

/// Commands from the Tokio runtime to the USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List all exportable USB devices (fresh snapshot)
    ListDevices {
        /// Channel to send the snapshot back
        response: tokio::sync::oneshot::Sender<Vec<DeviceRecord>>,
    },

    /// Open a device for exclusive export
    OpenDevice {
        /// Bus id of the device to open
        busid: BusId,
        /// Channel to send the opened device's record back
        response: tokio::sync::oneshot::Sender<Result<DeviceRecord, OpenError>>,
    },

    /// Close a previously opened device
    CloseDevice {
        /// Bus id of the device to close
        busid: BusId,
        /// Reports whether the device had been open
        response: tokio::sync::oneshot::Sender<bool>,
    },

    /// Execute one URB against an open device
    SubmitUrb {
        /// Bus id of the target device
        busid: BusId,
        /// The decoded submit command
        cmd: SubmitCmd,
        /// Channel to send the outcome back
        response: tokio::sync::oneshot::Sender<UrbOutcome>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Device events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// Device hot-plugged (connected)
    DeviceArrived {
        /// Full device record
        device: DeviceRecord,
    },

    /// Device hot-unplugged (disconnected)
    DeviceLeft {
        /// Bus id of the removed device
        busid: BusId,
    },
}

/// Handle for the Tokio runtime (async side)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB thread (blocking side)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for the USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command, blocking until one arrives
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the Tokio side has dropped its half of the bridge
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for the USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate the USB worker
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        // Send command from async context
        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_event_flow() {
        let (bridge, worker) = create_usb_bridge();

        std::thread::spawn(move || {
            worker
                .send_event(UsbEvent::DeviceLeft {
                    busid: protocol::BusId::new("1-1").unwrap(),
                })
                .unwrap();
        });

        let event = bridge.recv_event().await.unwrap();
        assert!(matches!(event, UsbEvent::DeviceLeft { .. }));
    }
}
