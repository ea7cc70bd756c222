//! Admission controller
//!
//! Enforces the per-connection, per-device, and server-wide pending-transfer
//! limits and owns the pending-transfer table. The table is the single
//! arbiter of a transfer's terminal event: completion, timeout, unlink,
//! connection close, and device disappearance all remove the entry through
//! `take*`, and only the caller that gets the entry back produces the reply.
//! Counters are updated together with the table under one mutex, so an
//! admission decision can never race a completion or cancellation.

use crate::ConnectionId;
use crate::error::{LimitScope, ResourceError};
use protocol::{Direction, Message};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// Concurrency bounds, copied from the validated configuration
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Concurrent in-flight requests per connection
    pub per_connection: usize,
    /// Pending URBs per device
    pub per_device: usize,
    /// Concurrent in-flight requests server-wide
    pub total: usize,
    /// Deadline applied to each admitted transfer
    pub timeout: Duration,
}

/// One admitted, not-yet-terminal transfer
#[derive(Debug)]
pub struct Pending {
    pub conn: ConnectionId,
    pub devid: u32,
    pub seqnum: u32,
    pub direction: Direction,
    pub ep: u32,
    pub submitted_at: Instant,
    pub deadline: Instant,
    /// Writer channel of the owning connection, for synthesized replies
    pub reply_tx: mpsc::Sender<Message>,
    cancel_tx: oneshot::Sender<()>,
}

impl Pending {
    /// Signal best-effort abort to the transfer task
    pub fn cancel(self) {
        let _ = self.cancel_tx.send(());
    }
}

/// Grant returned by a successful admission
#[derive(Debug)]
pub struct Admitted {
    /// When the transfer times out
    pub deadline: Instant,
    /// Fires when the entry is taken by unlink or device disappearance
    pub cancel_rx: oneshot::Receiver<()>,
}

/// Immediate admission rejection
///
/// Rejections are returned to the caller synchronously; a request is never
/// queued behind a full table.
#[derive(Debug, Error)]
pub enum AdmitReject {
    #[error(transparent)]
    Exhausted(ResourceError),

    /// The (device, sequence) key is already pending
    #[error("sequence number {seqnum} is already pending")]
    DuplicateSeqnum { seqnum: u32 },
}

impl AdmitReject {
    /// Wire status carried in the rejection reply
    pub fn wire_status(&self) -> i32 {
        match self {
            Self::Exhausted(e) => e.wire_status(),
            Self::DuplicateSeqnum { .. } => protocol::status::INVALID,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Pending transfers keyed by (devid, seqnum) for O(1) unlink/completion
    pending: HashMap<(u32, u32), Pending>,
    per_conn: HashMap<ConnectionId, usize>,
    per_dev: HashMap<u32, usize>,
    total: usize,
}

impl Inner {
    fn remove(&mut self, key: (u32, u32)) -> Option<Pending> {
        let entry = self.pending.remove(&key)?;
        self.total -= 1;
        if let Some(count) = self.per_conn.get_mut(&entry.conn) {
            *count -= 1;
            if *count == 0 {
                self.per_conn.remove(&entry.conn);
            }
        }
        if let Some(count) = self.per_dev.get_mut(&entry.devid) {
            *count -= 1;
            if *count == 0 {
                self.per_dev.remove(&entry.devid);
            }
        }
        Some(entry)
    }
}

/// Bounded, cancellable pending-transfer table
pub struct AdmissionController {
    limits: Limits,
    inner: Mutex<Inner>,
}

impl AdmissionController {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a submit request, allocating its pending-transfer entry
    ///
    /// Rejects immediately when any limit is reached so back-pressure is
    /// visible to the client as an error status, not as latency.
    pub fn admit(
        &self,
        conn: ConnectionId,
        devid: u32,
        seqnum: u32,
        direction: Direction,
        ep: u32,
        reply_tx: mpsc::Sender<Message>,
    ) -> Result<Admitted, AdmitReject> {
        let mut inner = self.inner();

        if inner.total >= self.limits.total {
            return Err(AdmitReject::Exhausted(ResourceError::ResourceExhausted(
                LimitScope::Server,
            )));
        }
        if inner.per_conn.get(&conn).copied().unwrap_or(0) >= self.limits.per_connection {
            return Err(AdmitReject::Exhausted(ResourceError::ResourceExhausted(
                LimitScope::Connection,
            )));
        }
        if inner.per_dev.get(&devid).copied().unwrap_or(0) >= self.limits.per_device {
            return Err(AdmitReject::Exhausted(ResourceError::ResourceExhausted(
                LimitScope::Device,
            )));
        }
        if inner.pending.contains_key(&(devid, seqnum)) {
            return Err(AdmitReject::DuplicateSeqnum { seqnum });
        }

        let now = Instant::now();
        let deadline = now + self.limits.timeout;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        inner.pending.insert(
            (devid, seqnum),
            Pending {
                conn,
                devid,
                seqnum,
                direction,
                ep,
                submitted_at: now,
                deadline,
                reply_tx,
                cancel_tx,
            },
        );
        inner.total += 1;
        *inner.per_conn.entry(conn).or_insert(0) += 1;
        *inner.per_dev.entry(devid).or_insert(0) += 1;

        debug!(
            "Admitted transfer devid={:#x} seqnum={} for {} ({} pending)",
            devid, seqnum, conn, inner.total
        );

        Ok(Admitted {
            deadline,
            cancel_rx,
        })
    }

    /// Take the pending entry for (devid, seqnum), if still pending
    ///
    /// Whoever gets `Some` owns the transfer's single terminal event.
    pub fn take(&self, devid: u32, seqnum: u32) -> Option<Pending> {
        self.inner().remove((devid, seqnum))
    }

    /// Take every pending entry owned by a connection (connection close)
    pub fn take_connection(&self, conn: ConnectionId) -> Vec<Pending> {
        let mut inner = self.inner();
        let keys: Vec<(u32, u32)> = inner
            .pending
            .values()
            .filter(|p| p.conn == conn)
            .map(|p| (p.devid, p.seqnum))
            .collect();
        keys.into_iter().filter_map(|k| inner.remove(k)).collect()
    }

    /// Take every pending entry for a device (device disappearance)
    pub fn take_device(&self, devid: u32) -> Vec<Pending> {
        let mut inner = self.inner();
        let keys: Vec<(u32, u32)> = inner
            .pending
            .values()
            .filter(|p| p.devid == devid)
            .map(|p| (p.devid, p.seqnum))
            .collect();
        keys.into_iter().filter_map(|k| inner.remove(k)).collect()
    }

    pub fn pending_total(&self) -> usize {
        self.inner().total
    }

    pub fn pending_for_connection(&self, conn: ConnectionId) -> usize {
        self.inner().per_conn.get(&conn).copied().unwrap_or(0)
    }

    pub fn pending_for_device(&self, devid: u32) -> usize {
        self.inner().per_dev.get(&devid).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(per_connection: usize, per_device: usize, total: usize) -> AdmissionController {
        AdmissionController::new(Limits {
            per_connection,
            per_device,
            total,
            timeout: Duration::from_secs(5),
        })
    }

    fn reply_tx() -> mpsc::Sender<Message> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn test_admit_and_take() {
        let controller = controller(4, 4, 8);
        let conn = ConnectionId(1);

        let admitted = controller
            .admit(conn, 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        assert!(admitted.deadline > Instant::now());
        assert_eq!(controller.pending_total(), 1);

        let pending = controller.take(1, 1).unwrap();
        assert_eq!(pending.seqnum, 1);
        assert_eq!(controller.pending_total(), 0);

        // Second take resolves the completion/unlink race: nothing left
        assert!(controller.take(1, 1).is_none());
    }

    #[tokio::test]
    async fn test_per_device_limit() {
        let controller = controller(8, 2, 16);
        let conn = ConnectionId(1);

        controller
            .admit(conn, 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        controller
            .admit(conn, 1, 2, Direction::In, 1, reply_tx())
            .unwrap();

        let err = controller
            .admit(conn, 1, 3, Direction::In, 1, reply_tx())
            .unwrap_err();
        assert!(matches!(
            err,
            AdmitReject::Exhausted(ResourceError::ResourceExhausted(LimitScope::Device))
        ));

        // A different device is unaffected
        controller
            .admit(conn, 2, 3, Direction::In, 1, reply_tx())
            .unwrap();
    }

    #[tokio::test]
    async fn test_per_connection_limit() {
        let controller = controller(1, 8, 16);

        controller
            .admit(ConnectionId(1), 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        let err = controller
            .admit(ConnectionId(1), 2, 2, Direction::In, 1, reply_tx())
            .unwrap_err();
        assert!(matches!(
            err,
            AdmitReject::Exhausted(ResourceError::ResourceExhausted(LimitScope::Connection))
        ));

        // Another connection still has room
        controller
            .admit(ConnectionId(2), 2, 2, Direction::In, 1, reply_tx())
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_wide_limit() {
        let controller = controller(8, 8, 2);

        controller
            .admit(ConnectionId(1), 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        controller
            .admit(ConnectionId(2), 2, 1, Direction::In, 1, reply_tx())
            .unwrap();
        let err = controller
            .admit(ConnectionId(3), 3, 1, Direction::In, 1, reply_tx())
            .unwrap_err();
        assert!(matches!(
            err,
            AdmitReject::Exhausted(ResourceError::ResourceExhausted(LimitScope::Server))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_seqnum() {
        let controller = controller(8, 8, 16);
        let conn = ConnectionId(1);

        controller
            .admit(conn, 1, 7, Direction::In, 1, reply_tx())
            .unwrap();
        let err = controller
            .admit(conn, 1, 7, Direction::In, 1, reply_tx())
            .unwrap_err();
        assert!(matches!(err, AdmitReject::DuplicateSeqnum { seqnum: 7 }));

        // The same seqnum on a different device is a different key
        controller
            .admit(conn, 2, 7, Direction::In, 1, reply_tx())
            .unwrap();
    }

    #[tokio::test]
    async fn test_take_connection_scopes_cancellation() {
        let controller = controller(8, 8, 16);

        controller
            .admit(ConnectionId(1), 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        controller
            .admit(ConnectionId(1), 1, 2, Direction::In, 1, reply_tx())
            .unwrap();
        controller
            .admit(ConnectionId(2), 2, 1, Direction::In, 1, reply_tx())
            .unwrap();

        let taken = controller.take_connection(ConnectionId(1));
        assert_eq!(taken.len(), 2);
        assert_eq!(controller.pending_total(), 1);
        assert_eq!(controller.pending_for_connection(ConnectionId(2)), 1);
    }

    #[tokio::test]
    async fn test_take_device_scopes_cancellation() {
        let controller = controller(8, 8, 16);

        controller
            .admit(ConnectionId(1), 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        controller
            .admit(ConnectionId(1), 2, 1, Direction::In, 1, reply_tx())
            .unwrap();

        let taken = controller.take_device(1);
        assert_eq!(taken.len(), 1);
        assert_eq!(controller.pending_for_device(1), 0);
        assert_eq!(controller.pending_for_device(2), 1);
    }

    #[tokio::test]
    async fn test_cancel_fires_receiver() {
        let controller = controller(8, 8, 16);
        let admitted = controller
            .admit(ConnectionId(1), 1, 1, Direction::In, 1, reply_tx())
            .unwrap();

        let pending = controller.take(1, 1).unwrap();
        pending.cancel();
        assert!(admitted.cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_slot_frees_after_take() {
        let controller = controller(1, 1, 1);
        let conn = ConnectionId(1);

        controller
            .admit(conn, 1, 1, Direction::In, 1, reply_tx())
            .unwrap();
        assert!(controller.admit(conn, 1, 2, Direction::In, 1, reply_tx()).is_err());

        controller.take(1, 1).unwrap();
        controller
            .admit(conn, 1, 2, Direction::In, 1, reply_tx())
            .unwrap();
    }
}
