//! USB worker thread
//!
//! Dedicated OS thread for blocking device I/O. Processes commands from the
//! Tokio runtime, executes them against the registry, and pushes device
//! change events back over the bridge.

use crate::usb::backend::DeviceBackend;
use crate::usb::registry::DeviceRegistry;
use common::{UrbOutcome, UsbCommand, UsbWorker};
use std::time::Duration;
use tracing::{debug, error, info};

/// How long one loop iteration waits for backend events
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// USB worker thread state
pub struct UsbWorkerThread {
    registry: DeviceRegistry,
    worker: UsbWorker,
    /// Response channels for transfers that will never resolve; held so the
    /// waiting side keeps waiting until its deadline instead of seeing a
    /// dropped channel
    stalled: Vec<tokio::sync::oneshot::Sender<UrbOutcome>>,
}

impl UsbWorkerThread {
    /// Create the worker and run the initial enumeration
    pub fn new(worker: UsbWorker, backend: Box<dyn DeviceBackend>, filters: Vec<String>) -> Self {
        let mut registry = DeviceRegistry::new(backend, filters);
        registry.initialize();

        Self {
            registry,
            worker,
            stalled: Vec::new(),
        }
    }

    /// Run the worker loop until a Shutdown command arrives
    ///
    /// Each iteration drains pending commands, then polls the backend for
    /// device changes and forwards them as events.
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => {
                    self.handle_command(cmd);
                    continue;
                }
                None if self.worker.is_closed() => {
                    info!("Command channel closed, USB worker stopping");
                    break;
                }
                None => {}
            }

            for event in self.registry.poll(EVENT_POLL_INTERVAL) {
                if self.worker.send_event(event).is_err() {
                    info!("Event channel closed, USB worker stopping");
                    return;
                }
            }
        }

        info!("USB worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        // A panicking backend must not take the worker thread down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.registry.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::OpenDevice { busid, response } => {
                debug!("Opening device {}", busid);
                let _ = response.send(self.registry.open_device(&busid));
            }

            UsbCommand::CloseDevice { busid, response } => {
                debug!("Closing device {}", busid);
                let _ = response.send(self.registry.close_device(&busid));
            }

            UsbCommand::SubmitUrb {
                busid,
                cmd,
                response,
            } => {
                debug!("Submitting URB seqnum={} to {}", cmd.seqnum, busid);
                match self.registry.submit(&busid, &cmd) {
                    Some(outcome) => {
                        let _ = response.send(outcome);
                    }
                    None => self.stalled.push(response),
                }
            }

            UsbCommand::Shutdown => {
                // Handled in the main loop
                unreachable!()
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command arrives or the bridge closes.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    backend: Box<dyn DeviceBackend>,
    filters: Vec<String>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            UsbWorkerThread::new(worker, backend, filters).run();
        })
        .expect("Failed to spawn USB worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::backend::{MockBackend, mock_device};
    use common::{UsbCommand, create_usb_bridge};
    use protocol::BusId;

    #[tokio::test]
    async fn test_worker_lists_and_opens() {
        let backend = MockBackend::new();
        backend.handle().seed_device(mock_device(1, 1));

        let (bridge, worker) = create_usb_bridge();
        let handle = spawn_usb_worker(worker, Box::new(backend), vec![]);

        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();
        let devices = rx.await.unwrap();
        assert_eq!(devices.len(), 1);

        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::OpenDevice {
                busid: BusId::new("1-1").unwrap(),
                response: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_ok());

        bridge.send_command(UsbCommand::Shutdown).await.unwrap();
        handle.join().unwrap();
    }
}
