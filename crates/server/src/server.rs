//! Server coordinator
//!
//! Wires the TCP listener, the USB worker, the claim manager, and the
//! admission controller together, owns the start/stop lifecycle, and reacts
//! to device hotplug events. This is the only surface the host process
//! drives: `start`, `stop`, `is_running`, and the error callback.

use crate::ConnectionId;
use crate::admission::{AdmissionController, Limits};
use crate::claim::ClaimManager;
use crate::config::ServerConfig;
use crate::error::{DeviceError, ResourceError, ServerError};
use crate::session::ConnectionSession;
use crate::usb::{DeviceBackend, spawn_usb_worker};
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge};
use protocol::{BusId, Message, SubmitReply, status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Callback invoked for conditions the host process must react to
pub type ErrorCallback = Arc<dyn Fn(&ServerError) + Send + Sync>;

/// Host-side USB/IP server
pub struct UsbIpServer {
    config: ServerConfig,
    bridge: UsbBridge,
    claims: Arc<ClaimManager>,
    admission: Arc<AdmissionController>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
    running: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    on_error: Option<ErrorCallback>,
    next_conn_id: Arc<AtomicU64>,
    active_connections: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
}

impl UsbIpServer {
    /// Build a server over the given device backend
    ///
    /// The USB worker thread starts immediately so enumeration and claim
    /// restoration have a device registry to talk to; the network side only
    /// comes up in [`start`](Self::start).
    pub fn new(config: ServerConfig, backend: Box<dyn DeviceBackend>) -> Self {
        let (bridge, worker) = create_usb_bridge();
        let worker_handle =
            spawn_usb_worker(worker, backend, config.usb.allowed_devices.clone());

        let claims = Arc::new(ClaimManager::new(
            bridge.clone(),
            config.state.claim_state_path.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(Limits {
            per_connection: config.limits.max_concurrent_requests,
            per_device: config.limits.max_pending_urbs_per_device,
            total: config.limits.max_total_concurrent_requests,
            timeout: config.limits.usb_operation_timeout,
        }));

        Self {
            config,
            bridge,
            claims,
            admission,
            worker_handle: Some(worker_handle),
            running: false,
            shutdown_tx: None,
            tasks: Vec::new(),
            on_error: None,
            next_conn_id: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
        }
    }

    /// Register the fatal-error callback
    pub fn set_on_error(&mut self, callback: impl Fn(&ServerError) + Send + Sync + 'static) {
        self.on_error = Some(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Bound address once running (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn claims(&self) -> &Arc<ClaimManager> {
        &self.claims
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Validate configuration, start device-change notifications, restore
    /// persisted claims, then bring up the network listener
    ///
    /// Any failure unwinds the components already started and surfaces as
    /// `InitializationFailed`.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.running {
            return Err(ServerError::AlreadyRunning);
        }

        self.config
            .validate()
            .map_err(|e| ServerError::InitializationFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Device-change notifications before the listener, so a client can
        // never observe a device the pump does not track
        let event_task = tokio::spawn(event_pump(
            self.bridge.clone(),
            self.claims.clone(),
            self.admission.clone(),
            self.config.usb.auto_bind_devices,
            shutdown_rx.clone(),
        ));

        self.claims.restore_claims().await;

        if self.config.usb.auto_bind_devices {
            auto_bind_all(&self.bridge, &self.claims).await;
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.network.port));
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = shutdown_tx.send(true);
                event_task.abort();
                return Err(ServerError::InitializationFailed(format!(
                    "failed to bind {}: {}",
                    bind_addr, e
                )));
            }
        };
        self.local_addr = listener.local_addr().ok();
        info!(
            "usbip-host server listening on {}",
            self.local_addr
                .map_or_else(|| bind_addr.to_string(), |a| a.to_string())
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.bridge.clone(),
            self.claims.clone(),
            self.admission.clone(),
            self.config.network.max_connections,
            self.config.limits.max_usb_buffer_size,
            self.next_conn_id.clone(),
            self.active_connections.clone(),
            shutdown_rx,
            self.on_error.clone(),
        ));

        self.shutdown_tx = Some(shutdown_tx);
        self.tasks = vec![event_task, accept_task];
        self.running = true;
        Ok(())
    }

    /// Stop notifications and the listener
    ///
    /// Only valid while running. Established sessions wind down as their
    /// sockets close; the claim set is persisted on the way out.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.claims.save_state();
        self.local_addr = None;
        self.running = false;
        info!("usbip-host server stopped");
        Ok(())
    }

    /// Tear the server down completely, including the USB worker thread
    pub async fn shutdown(mut self) {
        if self.running {
            let _ = self.stop();
        }

        if self.bridge.send_command(UsbCommand::Shutdown).await.is_err() {
            debug!("USB worker already gone at shutdown");
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Accept loop: admission-check and spawn one session per connection
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    bridge: UsbBridge,
    claims: Arc<ClaimManager>,
    admission: Arc<AdmissionController>,
    max_connections: usize,
    max_buffer: usize,
    next_conn_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
    on_error: Option<ErrorCallback>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if active.load(Ordering::SeqCst) >= max_connections {
                        warn!(
                            "Rejecting connection from {}: {}",
                            peer,
                            ResourceError::TooManyConnections
                        );
                        drop(stream);
                        continue;
                    }

                    let id = ConnectionId(next_conn_id.fetch_add(1, Ordering::SeqCst) + 1);
                    info!("Accepted connection from {} as {}", peer, id);
                    let _ = stream.set_nodelay(true);

                    active.fetch_add(1, Ordering::SeqCst);
                    let session = ConnectionSession::new(
                        id,
                        bridge.clone(),
                        claims.clone(),
                        admission.clone(),
                        max_buffer,
                    );
                    let active = active.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.run(stream).await {
                            debug!("Session {} ended with error: {:#}", id, e);
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    if let Some(callback) = &on_error {
                        callback(&ServerError::Internal(format!("accept failed: {}", e)));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Device-change pump: auto-bind arrivals, tear down on departures
async fn event_pump(
    bridge: UsbBridge,
    claims: Arc<ClaimManager>,
    admission: Arc<AdmissionController>,
    auto_bind: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            event = bridge.recv_event() => match event {
                Ok(UsbEvent::DeviceArrived { device }) => {
                    info!("Device arrived: {}", device.label());
                    if auto_bind {
                        let busid = device.desc.busid.clone();
                        if let Err(e) = claims.claim(&busid, None).await {
                            warn!("Auto-bind of {} failed: {}", busid, e);
                        }
                    }
                }
                Ok(UsbEvent::DeviceLeft { busid }) => {
                    handle_device_left(&claims, &admission, &busid).await;
                }
                Err(_) => {
                    debug!("USB event channel closed");
                    break;
                }
            }
        }
    }
    debug!("Event pump stopped");
}

/// A claimed device disconnected: fail its pending transfers with a
/// device-gone status and release the claim
///
/// The owning connection stays open; its next submit observes the revoked
/// claim and the session falls back toward the device-listed state.
async fn handle_device_left(
    claims: &ClaimManager,
    admission: &AdmissionController,
    busid: &BusId,
) {
    info!("Device left: {}", busid);

    let Some(devid) = claims.devid_of(busid) else {
        return;
    };

    let pending = admission.take_device(devid);
    if !pending.is_empty() {
        warn!(
            "Failing {} pending transfers for {}: {}",
            pending.len(),
            busid,
            DeviceError::DeviceGone
        );
        for entry in pending {
            let reply = SubmitReply::error(
                entry.seqnum,
                devid,
                entry.direction,
                entry.ep,
                status::DEVICE_GONE,
            );
            let _ = entry.reply_tx.send(Message::SubmitReply(reply)).await;
            entry.cancel();
        }
    }

    claims.release(busid).await;
}

/// Claim every exportable device (auto-bind at startup)
async fn auto_bind_all(bridge: &UsbBridge, claims: &ClaimManager) {
    let (tx, rx) = oneshot::channel();
    if bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .is_err()
    {
        warn!("Auto-bind skipped: USB worker unavailable");
        return;
    }

    let Ok(devices) = rx.await else {
        warn!("Auto-bind skipped: USB worker unavailable");
        return;
    };

    for device in devices {
        let busid = device.desc.busid.clone();
        match claims.claim(&busid, None).await {
            Ok(record) => info!("Auto-bound {}", record.label()),
            Err(e) => warn!("Auto-bind of {} failed: {}", busid, e),
        }
    }
}
