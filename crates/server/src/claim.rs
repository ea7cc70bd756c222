//! Device claim manager
//!
//! Grants and revokes exclusive ownership of devices for export and persists
//! the claim set across restarts. All claim-table mutations go through one
//! mutex with O(1) critical sections; the blocking device open happens
//! between a reservation and its finalization, never under the lock.

use crate::ConnectionId;
use crate::error::DeviceError;
use common::{DeviceRecord, OpenError, UsbBridge, UsbCommand};
use protocol::BusId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// How a device was wrested from its local drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimMethod {
    /// Kernel driver detached, interfaces claimed by the server
    DriverUnbind,
}

/// Lifecycle of one claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Reserved; the device open is in flight
    Claiming,
    /// Device held open for export
    Claimed,
    /// Claim ended (reported in release outcomes)
    Released,
    /// Claim attempt failed (reported during restoration)
    Error,
}

/// One claimed device
///
/// At most one of these exists per bus id, and at most one connection owns
/// it; both invariants are enforced under the claim-table mutex.
#[derive(Debug, Clone)]
pub struct ClaimedDevice {
    pub busid: BusId,
    pub claimed_at: SystemTime,
    pub method: ClaimMethod,
    pub state: ClaimState,
    /// Owning connection; `None` for restored or auto-bound claims until a
    /// connection imports the device
    pub owner: Option<ConnectionId>,
    /// Device record captured when the claim was opened
    pub record: Option<DeviceRecord>,
}

/// Result of a release request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The claim was held and is now released
    Released { owner: Option<ConnectionId> },
    /// Nothing to do; the device was not claimed
    WasNotClaimed,
}

/// Persisted form of one claim
#[derive(Debug, Serialize, Deserialize)]
struct PersistedClaim {
    busid: String,
    claimed_at: SystemTime,
    method: ClaimMethod,
}

/// Exclusive-claim table with on-disk persistence
pub struct ClaimManager {
    table: Mutex<HashMap<BusId, ClaimedDevice>>,
    state_path: PathBuf,
    bridge: UsbBridge,
}

impl ClaimManager {
    pub fn new(bridge: UsbBridge, state_path: PathBuf) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            state_path,
            bridge,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<BusId, ClaimedDevice>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a device for export
    ///
    /// With `owner` set this is an import: a restored or auto-bound claim
    /// with no owner is adopted, a claim owned elsewhere fails with
    /// `DeviceBusy`. With `owner == None` (auto-bind, restoration) an
    /// existing claim is left as-is.
    pub async fn claim(
        &self,
        busid: &BusId,
        owner: Option<ConnectionId>,
    ) -> Result<DeviceRecord, DeviceError> {
        // Phase 1: reserve under the lock
        {
            let mut table = self.table();
            if let Some(entry) = table.get_mut(busid) {
                return match (entry.state, entry.owner, owner) {
                    (ClaimState::Claimed, None, Some(conn)) => {
                        entry.owner = Some(conn);
                        info!("Connection {} adopted existing claim on {}", conn, busid);
                        entry
                            .record
                            .clone()
                            .ok_or_else(|| DeviceError::ClaimFailed("claim has no record".into()))
                    }
                    (ClaimState::Claimed, None, None) => entry
                        .record
                        .clone()
                        .ok_or_else(|| DeviceError::ClaimFailed("claim has no record".into())),
                    _ => Err(DeviceError::DeviceBusy),
                };
            }

            table.insert(
                busid.clone(),
                ClaimedDevice {
                    busid: busid.clone(),
                    claimed_at: SystemTime::now(),
                    method: ClaimMethod::DriverUnbind,
                    state: ClaimState::Claiming,
                    owner,
                    record: None,
                },
            );
        }

        // Phase 2: open the device outside the lock
        let open_result = self.open_device(busid).await;

        // Phase 3: finalize or roll back
        match open_result {
            Ok(record) => {
                {
                    let mut table = self.table();
                    if let Some(entry) = table.get_mut(busid) {
                        entry.state = ClaimState::Claimed;
                        entry.record = Some(record.clone());
                    }
                }
                self.save_state();
                info!(
                    "Claimed device {} for {}",
                    record.label(),
                    owner.map_or_else(|| "export".to_string(), |c| c.to_string())
                );
                Ok(record)
            }
            Err(error) => {
                // Terminal state recorded on the way out; the entry itself
                // is dropped so the bus id is claimable again
                if let Some(mut entry) = self.table().remove(busid) {
                    entry.state = ClaimState::Error;
                    debug!("Claim on {} ended in state {:?}", busid, entry.state);
                }
                Err(error)
            }
        }
    }

    async fn open_device(&self, busid: &BusId) -> Result<DeviceRecord, DeviceError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bridge
            .send_command(UsbCommand::OpenDevice {
                busid: busid.clone(),
                response: tx,
            })
            .await
            .map_err(|e| DeviceError::ClaimFailed(e.to_string()))?;

        match rx.await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(OpenError::NotFound)) => Err(DeviceError::NotFound),
            Ok(Err(OpenError::Busy)) => Err(DeviceError::DeviceBusy),
            Ok(Err(OpenError::Io(e))) => Err(DeviceError::ClaimFailed(e)),
            Err(_) => Err(DeviceError::ClaimFailed("USB worker unavailable".into())),
        }
    }

    /// Release a claim
    ///
    /// Idempotent: releasing an unclaimed device reports `WasNotClaimed`
    /// without erroring.
    pub async fn release(&self, busid: &BusId) -> ReleaseOutcome {
        let removed = {
            let mut table = self.table();
            table.remove(busid).map(|mut entry| {
                entry.state = ClaimState::Released;
                entry
            })
        };

        let Some(entry) = removed else {
            debug!("Release of {}: was not claimed", busid);
            return ReleaseOutcome::WasNotClaimed;
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .bridge
            .send_command(UsbCommand::CloseDevice {
                busid: busid.clone(),
                response: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        self.save_state();
        info!("Released claim on {}", busid);
        ReleaseOutcome::Released { owner: entry.owner }
    }

    /// Release every claim owned by `conn`; returns the released bus ids
    pub async fn release_for_connection(&self, conn: ConnectionId) -> Vec<BusId> {
        let owned: Vec<BusId> = self
            .table()
            .values()
            .filter(|entry| entry.owner == Some(conn))
            .map(|entry| entry.busid.clone())
            .collect();

        for busid in &owned {
            self.release(busid).await;
        }
        owned
    }

    /// Whether `conn` currently owns the claim on `busid`
    pub fn is_claimed_by(&self, busid: &BusId, conn: ConnectionId) -> bool {
        self.table()
            .get(busid)
            .is_some_and(|entry| entry.state == ClaimState::Claimed && entry.owner == Some(conn))
    }

    /// Device id of a claimed device, if known
    pub fn devid_of(&self, busid: &BusId) -> Option<u32> {
        self.table()
            .get(busid)?
            .record
            .as_ref()
            .map(|r| r.desc.devid())
    }

    /// Snapshot of currently claimed bus ids
    pub fn claimed_busids(&self) -> Vec<BusId> {
        self.table()
            .values()
            .filter(|entry| entry.state == ClaimState::Claimed)
            .map(|entry| entry.busid.clone())
            .collect()
    }

    /// Re-acquire every device recorded in the persisted claim state
    ///
    /// Best-effort and non-retrying: each device restores independently, a
    /// failure is logged and does not abort the rest. The saved set is
    /// rewritten afterwards, dropping claims that failed to restore.
    pub async fn restore_claims(&self) {
        let persisted = match self.load_state() {
            Ok(claims) => claims,
            Err(e) => {
                debug!("No claim state restored: {}", e);
                return;
            }
        };

        if persisted.is_empty() {
            return;
        }

        info!("Restoring {} persisted claims", persisted.len());
        for claim in persisted {
            let busid = match BusId::new(claim.busid.clone()) {
                Ok(busid) => busid,
                Err(e) => {
                    warn!("Skipping persisted claim '{}': {}", claim.busid, e);
                    continue;
                }
            };

            match self.claim(&busid, None).await {
                Ok(record) => info!("Restored claim on {}", record.label()),
                Err(e) => warn!("Failed to restore claim on {}: {}", busid, e),
            }
        }

        self.save_state();
    }

    fn load_state(&self) -> anyhow::Result<Vec<PersistedClaim>> {
        let content = fs::read_to_string(&self.state_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the current claim set
    ///
    /// Failures are logged, not propagated; persistence is an aid to
    /// recovery, not a correctness requirement.
    pub fn save_state(&self) {
        let claims: Vec<PersistedClaim> = self
            .table()
            .values()
            .filter(|entry| entry.state == ClaimState::Claimed)
            .map(|entry| PersistedClaim {
                busid: entry.busid.as_str().to_string(),
                claimed_at: entry.claimed_at,
                method: entry.method,
            })
            .collect();

        let content = match serde_json::to_string_pretty(&claims) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to serialize claim state: {}", e);
                return;
            }
        };

        if let Some(parent) = self.state_path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!("Failed to create state directory {}: {}", parent.display(), e);
            return;
        }

        if let Err(e) = fs::write(&self.state_path, content) {
            warn!(
                "Failed to write claim state to {}: {}",
                self.state_path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{MockBackend, mock_device, spawn_usb_worker};
    use common::create_usb_bridge;

    fn manager(dir: &tempfile::TempDir) -> (ClaimManager, crate::usb::MockHandle) {
        let backend = MockBackend::new();
        let handle = backend.handle();
        handle.seed_device(mock_device(1, 1));

        let (bridge, worker) = create_usb_bridge();
        spawn_usb_worker(worker, Box::new(backend), vec![]);

        (
            ClaimManager::new(bridge, dir.path().join("claims.json")),
            handle,
        )
    }

    #[tokio::test]
    async fn test_claim_then_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (claims, _handle) = manager(&dir);
        let busid = BusId::new("1-1").unwrap();

        let record = claims.claim(&busid, Some(ConnectionId(1))).await.unwrap();
        assert_eq!(record.desc.busid, busid);
        assert!(claims.is_claimed_by(&busid, ConnectionId(1)));

        // Second connection cannot claim the same device
        let err = claims.claim(&busid, Some(ConnectionId(2))).await;
        assert_eq!(err, Err(DeviceError::DeviceBusy));
    }

    #[tokio::test]
    async fn test_claim_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let (claims, _handle) = manager(&dir);
        let err = claims
            .claim(&BusId::new("9-9").unwrap(), Some(ConnectionId(1)))
            .await;
        assert_eq!(err, Err(DeviceError::NotFound));
        // Failed claims leave no residue
        assert!(claims.claimed_busids().is_empty());
    }

    #[tokio::test]
    async fn test_release_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (claims, mock) = manager(&dir);
        let busid = BusId::new("1-1").unwrap();

        claims.claim(&busid, Some(ConnectionId(1))).await.unwrap();
        assert!(mock.is_open(&busid));

        let outcome = claims.release(&busid).await;
        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                owner: Some(ConnectionId(1))
            }
        );
        assert!(!mock.is_open(&busid));

        // Releasing again reports "was not claimed" rather than erroring
        assert_eq!(claims.release(&busid).await, ReleaseOutcome::WasNotClaimed);
    }

    #[tokio::test]
    async fn test_adoption_of_unowned_claim() {
        let dir = tempfile::tempdir().unwrap();
        let (claims, _handle) = manager(&dir);
        let busid = BusId::new("1-1").unwrap();

        // Auto-bind style claim with no owner
        claims.claim(&busid, None).await.unwrap();
        assert!(!claims.is_claimed_by(&busid, ConnectionId(1)));

        // First import adopts it
        claims.claim(&busid, Some(ConnectionId(1))).await.unwrap();
        assert!(claims.is_claimed_by(&busid, ConnectionId(1)));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let busid = BusId::new("1-1").unwrap();

        {
            let (claims, _handle) = manager(&dir);
            claims.claim(&busid, Some(ConnectionId(1))).await.unwrap();
        }

        // A fresh manager over the same state path restores the claim,
        // unowned until the next import
        let (claims, _handle) = manager(&dir);
        claims.restore_claims().await;
        assert_eq!(claims.claimed_busids(), vec![busid.clone()]);
        assert!(!claims.is_claimed_by(&busid, ConnectionId(1)));
    }

    #[tokio::test]
    async fn test_restore_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let busid = BusId::new("1-1").unwrap();

        {
            let (claims, mock) = manager(&dir);
            claims.claim(&busid, None).await.unwrap();
            // A second device that will vanish before the restart
            mock.add_device(mock_device(2, 2));
            claims
                .claim(&BusId::new("2-2").unwrap(), None)
                .await
                .unwrap();
        }

        // 2-2 is absent after the "restart"; its restoration fails without
        // aborting 1-1's
        let (claims, _handle) = manager(&dir);
        claims.restore_claims().await;
        assert_eq!(claims.claimed_busids(), vec![busid]);
    }

    #[tokio::test]
    async fn test_release_for_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (claims, _handle) = manager(&dir);
        let busid = BusId::new("1-1").unwrap();

        claims.claim(&busid, Some(ConnectionId(7))).await.unwrap();
        let released = claims.release_for_connection(ConnectionId(7)).await;
        assert_eq!(released, vec![busid.clone()]);
        assert!(claims.claimed_busids().is_empty());
    }
}
