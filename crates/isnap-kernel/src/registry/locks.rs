//! Per-snapshot and per-volume operation leases.
//!
//! Leases fail fast: a conflicting request is rejected, never queued.

use crate::error::{SnapError, SnapResult};
use crate::types::{Operation, SnapshotId, VolumeKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct VolumeSlot {
    reverting: Option<SnapshotId>,
    holders: BTreeMap<SnapshotId, Operation>,
}

impl VolumeSlot {
    fn is_empty(&self) -> bool {
        self.reverting.is_none() && self.holders.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockState {
    snapshots: HashMap<SnapshotId, Operation>,
    volumes: HashMap<VolumeKey, VolumeSlot>,
}

#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation currently holding `snapshot`, if any.
    pub fn busy(&self, snapshot: SnapshotId) -> Option<Operation> {
        self.inner.lock().snapshots.get(&snapshot).copied()
    }

    /// Snapshot whose revert currently owns `volume`, if any.
    pub fn reverting(&self, volume: &VolumeKey) -> Option<SnapshotId> {
        self.inner
            .lock()
            .volumes
            .get(volume)
            .and_then(|slot| slot.reverting)
    }

    pub(crate) fn acquire(
        self: &Arc<Self>,
        snapshot: SnapshotId,
        volume: VolumeKey,
        operation: Operation,
    ) -> SnapResult<SnapshotLease> {
        let mut state = self.inner.lock();
        if let Some(reverting) = state.volumes.get(&volume).and_then(|s| s.reverting) {
            return Err(SnapError::RevertInProgress { volume, reverting });
        }
        if let Some(held) = state.snapshots.get(&snapshot) {
            return Err(SnapError::OperationInProgress {
                snapshot,
                operation: *held,
            });
        }
        state.snapshots.insert(snapshot, operation);
        state
            .volumes
            .entry(volume.clone())
            .or_default()
            .holders
            .insert(snapshot, operation);
        Ok(SnapshotLease {
            table: Arc::clone(self),
            snapshot,
            volume,
            operation,
            exclusive: false,
        })
    }

    pub(crate) fn acquire_volume(
        self: &Arc<Self>,
        snapshot: SnapshotId,
        volume: VolumeKey,
    ) -> SnapResult<SnapshotLease> {
        let mut state = self.inner.lock();
        let slot = state.volumes.get(&volume);
        if let Some(reverting) = slot.and_then(|s| s.reverting) {
            return Err(SnapError::RevertInProgress { volume, reverting });
        }
        if let Some((busy, op)) = slot.and_then(|s| s.holders.iter().next()) {
            return Err(SnapError::OperationInProgress {
                snapshot: *busy,
                operation: *op,
            });
        }
        state.snapshots.insert(snapshot, Operation::Revert);
        state.volumes.entry(volume.clone()).or_default().reverting = Some(snapshot);
        Ok(SnapshotLease {
            table: Arc::clone(self),
            snapshot,
            volume,
            operation: Operation::Revert,
            exclusive: true,
        })
    }

    fn release(&self, lease: &SnapshotLease) {
        let mut state = self.inner.lock();
        state.snapshots.remove(&lease.snapshot);
        if let Some(slot) = state.volumes.get_mut(&lease.volume) {
            if lease.exclusive {
                slot.reverting = None;
            } else {
                slot.holders.remove(&lease.snapshot);
            }
            if slot.is_empty() {
                state.volumes.remove(&lease.volume);
            }
        }
    }
}

/// Held while an operation runs against a snapshot; released on drop.
#[derive(Debug)]
#[must_use = "the lease is released as soon as it is dropped"]
pub struct SnapshotLease {
    table: Arc<LockTable>,
    snapshot: SnapshotId,
    volume: VolumeKey,
    operation: Operation,
    exclusive: bool,
}

impl SnapshotLease {
    pub fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_volume_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        self.table.release(self);
    }
}
