//! Connection session
//!
//! One session per accepted connection, driving the protocol state machine
//! from handshake through device import to URB streaming. The session owns
//! an explicit read loop; replies flow through one channel per connection,
//! drained by a dedicated writer task, so transfer tasks completing out of
//! order never interleave partial messages on the wire.

use crate::ConnectionId;
use crate::admission::{Admitted, AdmissionController};
use crate::claim::ClaimManager;
use crate::error::ResourceError;
use anyhow::{Context as _, Result, anyhow};
use common::{DeviceRecord, UrbOutcome, UsbBridge, UsbCommand};
use protocol::{
    BusId, DevlistReply, Direction, ImportReply, ImportRequest, Message, ProtocolError, SubmitCmd,
    SubmitReply, UnlinkCmd, UnlinkReply, status,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Protocol state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing imported yet; device-list and import requests are valid
    Handshake,
    /// A device list has been served; further lists or an import may follow
    DeviceListed,
    /// An import is in flight through the registry and claim manager
    Importing,
    /// Exactly one device imported; only its submit/unlink traffic is valid
    Attached,
    /// Tearing down: cancelling pending transfers, releasing the claim
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::DeviceListed => "device-listed",
            Self::Importing => "importing",
            Self::Attached => "attached",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Whether the read loop keeps going after a message
enum Flow {
    Continue,
    Close,
}

/// The device this connection imported
struct ImportedDevice {
    busid: BusId,
    devid: u32,
}

/// Per-connection protocol state machine
pub struct ConnectionSession {
    id: ConnectionId,
    state: SessionState,
    /// Currently attached device
    imported: Option<ImportedDevice>,
    /// The one bus id this connection may ever import
    bound_busid: Option<BusId>,
    bridge: UsbBridge,
    claims: Arc<ClaimManager>,
    admission: Arc<AdmissionController>,
    max_buffer: usize,
    reply_tx: Option<mpsc::Sender<Message>>,
    reply_rx: Option<mpsc::Receiver<Message>>,
}

impl ConnectionSession {
    pub fn new(
        id: ConnectionId,
        bridge: UsbBridge,
        claims: Arc<ClaimManager>,
        admission: Arc<AdmissionController>,
        max_buffer: usize,
    ) -> Self {
        // Room for every admissible in-flight reply plus control traffic
        let capacity = admission.limits().per_connection + 8;
        let (reply_tx, reply_rx) = mpsc::channel(capacity);

        Self {
            id,
            state: SessionState::Handshake,
            imported: None,
            bound_busid: None,
            bridge,
            claims,
            admission,
            max_buffer,
            reply_tx: Some(reply_tx),
            reply_rx: Some(reply_rx),
        }
    }

    /// Drive the session over `stream` until the connection closes
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(reply_rx) = self.reply_rx.take() else {
            return Err(anyhow!("session already started"));
        };
        let (mut reader, writer) = tokio::io::split(stream);
        let writer_task = tokio::spawn(write_replies(writer, reply_rx));

        debug!("Session {} started", self.id);
        let result = self.read_loop(&mut reader).await;

        self.state = SessionState::Closing;
        self.cleanup().await;
        self.state = SessionState::Closed;

        // All reply senders are gone once cleanup cancelled the pending
        // transfers; the writer drains what is queued and exits
        let _ = writer_task.await;
        info!("Session {} closed", self.id);
        result
    }

    async fn read_loop<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = match protocol::read_message(reader, self.max_buffer).await {
                Ok(message) => message,
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Session {}: client disconnected", self.id);
                    return Ok(());
                }
                Err(ProtocolError::Io(e)) => {
                    debug!("Session {}: transport error: {}", self.id, e);
                    return Ok(());
                }
                Err(e) => {
                    // Framing-level violation: no message kind to answer, so
                    // the connection just closes
                    warn!("Session {}: protocol error: {}", self.id, e);
                    return Ok(());
                }
            };

            trace!("Session {}: received {:?}", self.id, message.command());
            match self.handle_message(message).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<Flow> {
        use SessionState::{Attached, DeviceListed, Handshake};

        match (self.state, message) {
            (Handshake | DeviceListed, Message::DevlistRequest) => self.handle_devlist().await,
            (Handshake | DeviceListed, Message::ImportRequest(request)) => {
                self.handle_import(request).await
            }
            (Attached, Message::SubmitCmd(cmd)) => self.handle_submit(cmd).await,
            (Attached, Message::UnlinkCmd(cmd)) => self.handle_unlink(cmd).await,
            (_, message) => self.reject_invalid_state(&message).await,
        }
    }

    /// Answer a structurally valid but state-illegal message
    ///
    /// The error reply is sent when the protocol defines one for the
    /// message kind; the connection closes either way.
    async fn reject_invalid_state(&mut self, message: &Message) -> Result<Flow> {
        let error = ProtocolError::InvalidState {
            state: self.state.as_str(),
        };
        warn!(
            "Session {}: {} ({:?} command)",
            self.id,
            error,
            message.command()
        );

        if let Some(reply) = invalid_state_reply(message) {
            self.send_reply(reply).await?;
        }
        Ok(Flow::Close)
    }

    async fn handle_devlist(&mut self) -> Result<Flow> {
        let devices = self.list_devices().await?;
        debug!("Session {}: listing {} devices", self.id, devices.len());

        let descs = devices.into_iter().map(|d| d.desc).collect();
        self.send_reply(Message::DevlistReply(DevlistReply::new(descs)))
            .await?;

        if self.state == SessionState::Handshake {
            self.state = SessionState::DeviceListed;
        }
        Ok(Flow::Continue)
    }

    async fn handle_import(&mut self, request: ImportRequest) -> Result<Flow> {
        // The imported device id never changes for a connection's lifetime
        if let Some(bound) = &self.bound_busid
            && *bound != request.busid
        {
            warn!(
                "Session {}: import of {} after binding to {}",
                self.id, request.busid, bound
            );
            self.send_reply(Message::ImportReply(ImportReply::error(status::INVALID)))
                .await?;
            return Ok(Flow::Close);
        }

        self.state = SessionState::Importing;
        match self.claims.claim(&request.busid, Some(self.id)).await {
            Ok(record) => {
                info!("Session {}: imported {}", self.id, record.label());
                self.bound_busid = Some(request.busid.clone());
                self.imported = Some(ImportedDevice {
                    busid: request.busid,
                    devid: record.desc.devid(),
                });
                self.state = SessionState::Attached;
                self.send_reply(Message::ImportReply(ImportReply::success(record.desc)))
                    .await?;
            }
            Err(error) => {
                info!(
                    "Session {}: import of {} failed: {}",
                    self.id, request.busid, error
                );
                self.state = SessionState::DeviceListed;
                self.send_reply(Message::ImportReply(ImportReply::error(
                    error.wire_status(),
                )))
                .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_submit(&mut self, cmd: SubmitCmd) -> Result<Flow> {
        let Some(device) = &self.imported else {
            return self.reject_invalid_state(&Message::SubmitCmd(cmd)).await;
        };
        let devid = device.devid;
        let busid = device.busid.clone();

        // Traffic for any other device id is a protocol violation
        if cmd.devid != devid {
            warn!(
                "Session {}: submit for device {:#010x} while attached to {:#010x}",
                self.id, cmd.devid, devid
            );
            self.send_reply(Message::SubmitReply(SubmitReply::error(
                cmd.seqnum,
                cmd.devid,
                cmd.direction,
                cmd.ep,
                status::INVALID,
            )))
            .await?;
            return Ok(Flow::Close);
        }

        // The claim can be revoked underneath us by a device disconnect;
        // the session drops back to the listing state and keeps serving
        if !self.claims.is_claimed_by(&busid, self.id) {
            info!("Session {}: device {} is gone", self.id, busid);
            self.send_reply(Message::SubmitReply(SubmitReply::error(
                cmd.seqnum,
                devid,
                cmd.direction,
                cmd.ep,
                status::DEVICE_GONE,
            )))
            .await?;
            self.imported = None;
            self.state = SessionState::DeviceListed;
            return Ok(Flow::Continue);
        }

        let reply_tx = self.reply_sender()?.clone();
        match self
            .admission
            .admit(self.id, devid, cmd.seqnum, cmd.direction, cmd.ep, reply_tx)
        {
            Err(reject) => {
                info!(
                    "Session {}: submit seqnum={} rejected: {}",
                    self.id, cmd.seqnum, reject
                );
                self.send_reply(Message::SubmitReply(SubmitReply::error(
                    cmd.seqnum,
                    devid,
                    cmd.direction,
                    cmd.ep,
                    reject.wire_status(),
                )))
                .await?;
            }
            Ok(admitted) => {
                let bridge = self.bridge.clone();
                let admission = self.admission.clone();
                let conn = self.id;
                tokio::spawn(run_transfer(conn, bridge, admission, busid, cmd, admitted));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_unlink(&mut self, cmd: UnlinkCmd) -> Result<Flow> {
        let Some(device) = &self.imported else {
            return self.reject_invalid_state(&Message::UnlinkCmd(cmd)).await;
        };
        let devid = device.devid;

        if cmd.devid != devid {
            warn!(
                "Session {}: unlink for device {:#010x} while attached to {:#010x}",
                self.id, cmd.devid, devid
            );
            self.send_reply(Message::UnlinkReply(UnlinkReply {
                seqnum: cmd.seqnum,
                devid: cmd.devid,
                status: status::INVALID,
            }))
            .await?;
            return Ok(Flow::Close);
        }

        // First terminal event wins: if the entry is still pending we cancel
        // it and own its reply; otherwise it already completed or timed out
        let reply = match self.admission.take(devid, cmd.unlink_seqnum) {
            Some(pending) => {
                debug!(
                    "Session {}: unlinked pending transfer seqnum={} ({}ms before its deadline)",
                    self.id,
                    cmd.unlink_seqnum,
                    pending
                        .deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis()
                );
                pending.cancel();
                UnlinkReply::cancelled(cmd.seqnum, cmd.devid)
            }
            None => {
                debug!(
                    "Session {}: unlink seqnum={}: not pending",
                    self.id, cmd.unlink_seqnum
                );
                UnlinkReply::not_found(cmd.seqnum, cmd.devid)
            }
        };
        self.send_reply(Message::UnlinkReply(reply)).await?;
        Ok(Flow::Continue)
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let (tx, rx) = oneshot::channel();
        self.bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .context("USB worker unavailable")?;
        rx.await.context("USB worker dropped device list request")
    }

    fn reply_sender(&self) -> Result<&mpsc::Sender<Message>> {
        self.reply_tx
            .as_ref()
            .ok_or_else(|| anyhow!("connection writer closed"))
    }

    async fn send_reply(&self, message: Message) -> Result<()> {
        self.reply_sender()?
            .send(message)
            .await
            .map_err(|_| anyhow!("connection writer closed"))
    }

    /// Cancel everything this connection owns and release its claim
    async fn cleanup(&mut self) {
        let cancelled = self.admission.take_connection(self.id);
        if !cancelled.is_empty() {
            info!(
                "Session {}: cancelling {} pending transfers",
                self.id,
                cancelled.len()
            );
            for pending in cancelled {
                pending.cancel();
            }
        }

        for busid in self.claims.release_for_connection(self.id).await {
            info!("Session {}: released claim on {}", self.id, busid);
        }

        self.imported = None;
        // Closing our sender lets the writer drain and exit
        self.reply_tx = None;
    }
}

/// Error reply for a state-illegal message, where the protocol defines one
fn invalid_state_reply(message: &Message) -> Option<Message> {
    match message {
        Message::DevlistRequest => Some(Message::DevlistReply(DevlistReply::error(
            status::INVALID,
        ))),
        Message::ImportRequest(_) => {
            Some(Message::ImportReply(ImportReply::error(status::INVALID)))
        }
        Message::SubmitCmd(cmd) => Some(Message::SubmitReply(SubmitReply::error(
            cmd.seqnum,
            cmd.devid,
            cmd.direction,
            cmd.ep,
            status::INVALID,
        ))),
        Message::UnlinkCmd(cmd) => Some(Message::UnlinkReply(UnlinkReply {
            seqnum: cmd.seqnum,
            devid: cmd.devid,
            status: status::INVALID,
        })),
        // Inbound reply kinds have no reply of their own
        _ => None,
    }
}

/// Writer task: serialize every queued reply onto the connection
async fn write_replies<W>(mut writer: W, mut replies: mpsc::Receiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = replies.recv().await {
        if let Err(e) = protocol::write_message(&mut writer, &message).await {
            debug!("Reply write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// One admitted transfer racing device I/O against its deadline and
/// cancellation
///
/// Whichever arm takes the pending entry owns the single terminal reply;
/// a completion that loses the race is discarded, never double-replied.
async fn run_transfer(
    conn: ConnectionId,
    bridge: UsbBridge,
    admission: Arc<AdmissionController>,
    busid: BusId,
    cmd: SubmitCmd,
    admitted: Admitted,
) {
    let Admitted {
        deadline,
        mut cancel_rx,
    } = admitted;
    let (devid, seqnum, direction, ep) = (cmd.devid, cmd.seqnum, cmd.direction, cmd.ep);

    let (tx, rx) = oneshot::channel();
    let sent = bridge
        .send_command(UsbCommand::SubmitUrb {
            busid,
            cmd,
            response: tx,
        })
        .await;
    if sent.is_err() {
        if let Some(pending) = admission.take(devid, seqnum) {
            let reply = SubmitReply::error(seqnum, devid, direction, ep, status::IO_ERROR);
            let _ = pending.reply_tx.send(Message::SubmitReply(reply)).await;
        }
        return;
    }

    tokio::select! {
        outcome = rx => {
            let Some(pending) = admission.take(devid, seqnum) else {
                trace!("Transfer seqnum={} already terminal, discarding completion", seqnum);
                return;
            };
            let reply = match outcome {
                Ok(outcome) => submit_reply_from(seqnum, devid, direction, ep, outcome),
                Err(_) => SubmitReply::error(seqnum, devid, direction, ep, status::IO_ERROR),
            };
            let _ = pending.reply_tx.send(Message::SubmitReply(reply)).await;
        }
        _ = tokio::time::sleep_until(deadline) => {
            let Some(pending) = admission.take(devid, seqnum) else { return };
            warn!(
                "Transfer seqnum={} for {}: {} after {:?}",
                seqnum,
                conn,
                ResourceError::OperationTimeout,
                pending.submitted_at.elapsed()
            );
            let reply = SubmitReply::error(seqnum, devid, direction, ep, status::TIMEOUT);
            let _ = pending.reply_tx.send(Message::SubmitReply(reply)).await;
        }
        _ = &mut cancel_rx => {
            // Unlink or device disappearance took the entry and produced the
            // terminal reply; any late completion is dropped with it
            trace!("Transfer seqnum={} cancelled", seqnum);
        }
    }
}

fn submit_reply_from(
    seqnum: u32,
    devid: u32,
    direction: Direction,
    ep: u32,
    outcome: UrbOutcome,
) -> SubmitReply {
    if outcome.status == status::OK {
        let data = match direction {
            Direction::In => outcome.data,
            Direction::Out => Vec::new(),
        };
        SubmitReply::success(seqnum, devid, direction, ep, outcome.actual_length, data)
    } else {
        SubmitReply::error(seqnum, devid, direction, ep, outcome.status)
    }
}
