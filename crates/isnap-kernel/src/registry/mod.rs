//! The snapshot registry: single source of truth for snapshot state.
//!
//! Every mutation runs as a commit: the current [`RegistryState`] is cloned,
//! the change is applied and validated, the result is persisted through the
//! [`RegistryStore`], and only then swapped in. A failed validation or a
//! failed save leaves the registry untouched.
//!
//! State changes are compare-and-swap against the state machine in
//! [`crate::state_machine`]. Every applied event is chained onto the audit
//! head kept in the state and appended to the store's audit log after the
//! state itself is saved. The registry records intent and outcome; it never
//! talks to the array.
//!
//! Retired snapshots stay in the document until [`SnapshotRegistry::compact`]
//! drops them; their history survives in the audit log.

mod locks;

pub use locks::{LockTable, SnapshotLease};

use crate::error::{Missing, SnapError, SnapResult};
use crate::logging::{AuditLog, IntegrityViolation};
use crate::state_machine;
use crate::store::{MemoryStore, RegistryState, RegistryStore, STATE_VERSION};
use crate::types::*;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// What one [`SnapshotRegistry::compact`] pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub snapshots: usize,
    pub edges: usize,
    pub jobs: usize,
}

impl CompactionReport {
    pub fn is_empty(&self) -> bool {
        self.snapshots == 0 && self.edges == 0 && self.jobs == 0
    }
}

/// Outcome of an atomic revert
#[derive(Debug, Clone)]
pub struct RevertOutcome {
    pub reverted: Snapshot,
    /// Later snapshots on the chain that became STALE
    pub invalidated: Vec<SnapshotId>,
}

pub struct SnapshotRegistry {
    store: Box<dyn RegistryStore>,
    state: RwLock<RegistryState>,
    locks: Arc<LockTable>,
}

impl fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SnapshotRegistry")
            .field("store", &self.store.describe())
            .field("snapshots", &state.snapshots.len())
            .field("policies", &state.policies.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotRegistry {
    /// Opens a registry over `store`, loading whatever it already holds.
    ///
    /// Mount claims that were still PENDING when the previous process
    /// stopped are discarded.
    pub fn open(store: Box<dyn RegistryStore>) -> SnapResult<Self> {
        let mut state = store.load()?.unwrap_or_default();
        state.discard_in_flight();
        if state.version < STATE_VERSION {
            tracing::info!(
                store = %store.describe(),
                from = state.version,
                to = STATE_VERSION,
                "Upgrading registry document"
            );
            state.version = STATE_VERSION;
        }
        tracing::debug!(
            store = %store.describe(),
            snapshots = state.snapshots.len(),
            "Snapshot registry opened"
        );
        Ok(Self {
            store,
            state: RwLock::new(state),
            locks: Arc::new(LockTable::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryStore::new()),
            state: RwLock::new(RegistryState::default()),
            locks: Arc::new(LockTable::new()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        f(&self.state.read())
    }

    fn commit<T>(&self, f: impl FnOnce(&mut RegistryState) -> SnapResult<T>) -> SnapResult<T> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        let records = std::mem::take(&mut next.pending_audit);
        self.store.save(&next)?;
        *guard = next;
        if !records.is_empty() {
            // The saved head already covers these; a failed append shows up
            // as a broken trail in verify_audit.
            if let Err(e) = self.store.append_audit(&records) {
                tracing::error!(
                    store = %self.store.describe(),
                    records = records.len(),
                    error = %e,
                    "Failed to append audit records"
                );
            }
        }
        Ok(out)
    }

    /// Copy of the full registry state
    pub fn export(&self) -> RegistryState {
        self.read(Clone::clone)
    }

    // ---------------------------------------------------------------------
    // Storage policies
    // ---------------------------------------------------------------------

    /// Inserts or replaces a storage policy.
    ///
    /// # Errors
    /// `SnapError::Config` when the policy is malformed: no Primary copy,
    /// duplicate copy ids or names, a copy id already owned by another
    /// policy, or an unknown backup-copy source.
    pub fn define_policy(&self, policy: StoragePolicy) -> SnapResult<()> {
        self.commit(|state| {
            validate_policy(state, &policy)?;
            tracing::info!(
                policy = %policy.id,
                name = %policy.name,
                copies = policy.copies.len(),
                "Storage policy defined"
            );
            state.policies.insert(policy.id, policy);
            Ok(())
        })
    }

    pub fn policy(&self, id: StoragePolicyId) -> SnapResult<StoragePolicy> {
        self.read(|s| s.policies.get(&id).cloned())
            .ok_or_else(|| SnapError::policy_not_found(id))
    }

    pub fn policy_by_name(&self, name: &str) -> SnapResult<StoragePolicy> {
        self.read(|s| {
            s.policies
                .values()
                .find(|p| p.name.eq_ignore_ascii_case(name))
                .cloned()
        })
        .ok_or_else(|| SnapError::NotFound(Missing::PolicyName(name.to_string())))
    }

    pub fn policies(&self) -> Vec<StoragePolicy> {
        self.read(|s| s.policies.values().cloned().collect())
    }

    pub fn copy(&self, id: CopyId) -> SnapResult<PolicyCopy> {
        self.read(|s| find_copy(s, id).cloned())
            .ok_or_else(|| SnapError::copy_not_found(id))
    }

    /// Resolves `name` inside `policy` (case-insensitive).
    pub fn copy_by_name(&self, policy: StoragePolicyId, name: &str) -> SnapResult<PolicyCopy> {
        self.policy(policy)?
            .copy_by_name(name)
            .cloned()
            .ok_or_else(|| SnapError::NotFound(Missing::CopyName(name.to_string())))
    }

    // ---------------------------------------------------------------------
    // Backup jobs
    // ---------------------------------------------------------------------

    pub fn record_job(
        &self,
        level: BackupLevel,
        subclient: &str,
        volume: &str,
        started_at: DateTime<Utc>,
    ) -> SnapResult<BackupJob> {
        self.commit(|state| {
            let job = BackupJob {
                id: JobId(state.next_job),
                level,
                subclient: subclient.to_string(),
                volume: volume.to_string(),
                started_at,
                ended_at: None,
                status: JobStatus::Running,
            };
            state.next_job += 1;
            state.jobs.insert(job.id, job.clone());
            Ok(job)
        })
    }

    pub fn job(&self, id: JobId) -> SnapResult<BackupJob> {
        self.read(|s| s.jobs.get(&id).cloned())
            .ok_or(SnapError::NotFound(Missing::Job(id)))
    }

    /// Records the terminal status of a job. Only the status changes once a
    /// job has ended.
    pub fn finish_job(&self, id: JobId, status: JobStatus) -> SnapResult<BackupJob> {
        self.commit(|state| {
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or(SnapError::NotFound(Missing::Job(id)))?;
            job.status = status;
            if job.ended_at.is_none() && status.is_terminal() {
                job.ended_at = Some(now());
            }
            Ok(job.clone())
        })
    }

    pub fn jobs(&self) -> Vec<BackupJob> {
        self.read(|s| s.jobs.values().cloned().collect())
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Registers a new CREATED snapshot of `job` on `copy`.
    ///
    /// # Errors
    /// `DuplicateSnapshot` if the pair already has a non-retired snapshot,
    /// `DuplicateHandle` if a snapshot that is not DELETED holds `handle`.
    pub fn register(
        &self,
        job: JobId,
        copy: CopyId,
        handle: Option<ArrayHandle>,
        source: Option<SnapshotId>,
    ) -> SnapResult<Snapshot> {
        self.commit(|state| {
            let backup = state
                .jobs
                .get(&job)
                .ok_or(SnapError::NotFound(Missing::Job(job)))?;
            if find_copy(state, copy).is_none() {
                return Err(SnapError::copy_not_found(copy));
            }
            if let Some(existing) = state
                .snapshots
                .values()
                .find(|s| s.job == job && s.copy == copy && !s.state.is_retired())
            {
                return Err(SnapError::DuplicateSnapshot {
                    job,
                    copy,
                    existing: existing.id,
                });
            }
            if let Some(handle) = handle.as_ref() {
                if let Some(holder) = state
                    .snapshots
                    .values()
                    .find(|s| s.handle.as_ref() == Some(handle) && s.state != SnapshotState::Deleted)
                {
                    return Err(SnapError::DuplicateHandle {
                        handle: handle.clone(),
                        existing: holder.id,
                    });
                }
            }
            let snapshot = Snapshot {
                id: SnapshotId(state.next_snapshot),
                job,
                copy,
                volume: backup.volume.clone(),
                handle,
                state: SnapshotState::Created,
                prior_state: None,
                point_in_time: backup.started_at,
                created_at: now(),
                last_validated_at: None,
                source,
                retired_at: None,
            };
            state.next_snapshot += 1;
            state.snapshots.insert(snapshot.id, snapshot.clone());
            tracing::debug!(
                snapshot = %snapshot.id,
                job = %job,
                copy = %copy,
                "Snapshot registered"
            );
            Ok(snapshot)
        })
    }

    pub fn get(&self, id: SnapshotId) -> SnapResult<Snapshot> {
        self.read(|s| s.snapshots.get(&id).cloned())
            .ok_or_else(|| SnapError::snapshot_not_found(id))
    }

    /// Applies `event` to whatever state the snapshot is in now.
    pub fn transition(
        &self,
        id: SnapshotId,
        event: SnapshotEvent,
        correlation: Option<Uuid>,
    ) -> SnapResult<Snapshot> {
        self.commit(|state| apply_event(state, id, None, event, correlation))
    }

    /// Applies `event` only if the snapshot is still in `expected`.
    ///
    /// # Errors
    /// `InvalidTransition` if the state moved on or the event is illegal.
    pub fn compare_and_transition(
        &self,
        id: SnapshotId,
        expected: SnapshotState,
        event: SnapshotEvent,
        correlation: Option<Uuid>,
    ) -> SnapResult<Snapshot> {
        self.commit(|state| apply_event(state, id, Some(expected), event, correlation))
    }

    pub fn list_by_copy(&self, copy: CopyId) -> Vec<Snapshot> {
        self.list_where(|s| s.copy == copy)
    }

    /// Snapshots on one chain, oldest point in time first.
    pub fn list_by_volume(&self, volume: &VolumeKey) -> Vec<Snapshot> {
        self.list_where(|s| s.copy == volume.copy && s.volume == volume.volume)
    }

    pub fn list_by_job(&self, job: JobId) -> Vec<Snapshot> {
        self.list_where(|s| s.job == job)
    }

    pub fn list_all(&self) -> Vec<Snapshot> {
        self.list_where(|_| true)
    }

    fn list_where(&self, pred: impl Fn(&Snapshot) -> bool) -> Vec<Snapshot> {
        let mut out: Vec<Snapshot> =
            self.read(|s| s.snapshots.values().filter(|s| pred(s)).cloned().collect());
        out.sort_by_key(|s| (s.point_in_time, s.id));
        out
    }

    pub fn set_handle(&self, id: SnapshotId, handle: ArrayHandle) -> SnapResult<Snapshot> {
        self.commit(|state| {
            let snap = snapshot_mut(state, id)?;
            snap.handle = Some(handle);
            Ok(snap.clone())
        })
    }

    pub fn mark_validated(&self, id: SnapshotId) -> SnapResult<Snapshot> {
        self.commit(|state| {
            let snap = snapshot_mut(state, id)?;
            snap.last_validated_at = Some(now());
            Ok(snap.clone())
        })
    }

    /// Checks that `id` can be reverted now: its state accepts Revert and no
    /// later snapshot on the same volume chain is MOUNTED.
    ///
    /// # Errors
    /// `InvalidTransition`, naming the mounted later snapshot when that is
    /// what stands in the way.
    pub fn ensure_revertible(&self, id: SnapshotId) -> SnapResult<Snapshot> {
        self.read(|state| revertible(state, id).map(|(target, _)| target))
    }

    /// Atomically reverts `id` and invalidates every later live snapshot on
    /// the same chain.
    ///
    /// # Errors
    /// Same as [`SnapshotRegistry::ensure_revertible`].
    pub fn revert_chain(&self, id: SnapshotId, correlation: Option<Uuid>) -> SnapResult<RevertOutcome> {
        self.commit(|state| {
            let (target, later) = revertible(state, id)?;
            let reverted =
                apply_event(state, id, Some(target.state), SnapshotEvent::Revert, correlation)?;
            let mut invalidated = Vec::new();
            for snap in later
                .iter()
                .filter(|s| state_machine::allows(s.state, SnapshotEvent::Invalidate))
            {
                apply_event(state, snap.id, Some(snap.state), SnapshotEvent::Invalidate, correlation)?;
                invalidated.push(snap.id);
            }
            Ok(RevertOutcome {
                reverted,
                invalidated,
            })
        })
    }

    /// Drives a snapshot the array no longer has to DELETED, dropping its
    /// mount points. Terminal snapshots are returned unchanged.
    pub fn retire_missing(&self, id: SnapshotId, correlation: Option<Uuid>) -> SnapResult<Snapshot> {
        self.commit(|state| {
            let current = state
                .snapshots
                .get(&id)
                .map(|s| s.state)
                .ok_or_else(|| SnapError::snapshot_not_found(id))?;
            if current.is_terminal() {
                return Ok(state.snapshots[&id].clone());
            }
            state.mounts.retain(|m| m.snapshot != id);
            let path: &[SnapshotEvent] = match current {
                SnapshotState::Mounted => &[
                    SnapshotEvent::Unmount,
                    SnapshotEvent::BeginDelete,
                    SnapshotEvent::ConfirmDelete,
                ],
                SnapshotState::Created => &[
                    SnapshotEvent::Invalidate,
                    SnapshotEvent::BeginDelete,
                    SnapshotEvent::ConfirmDelete,
                ],
                SnapshotState::Deleting => &[SnapshotEvent::ConfirmDelete],
                _ => &[SnapshotEvent::BeginDelete, SnapshotEvent::ConfirmDelete],
            };
            let mut snap = state.snapshots[&id].clone();
            for event in path {
                snap = apply_event(state, id, Some(snap.state), *event, correlation)?;
            }
            Ok(snap)
        })
    }

    // ---------------------------------------------------------------------
    // Mount points
    // ---------------------------------------------------------------------

    /// Claims the (snapshot, destination) slot as PENDING.
    ///
    /// The claim is released when dropped unless completed.
    ///
    /// # Errors
    /// `MountConflict` if a mount point already exists for the pair.
    pub fn claim_mount(
        &self,
        id: SnapshotId,
        destination: &Destination,
        mount_path: &str,
        access: AccessMode,
    ) -> SnapResult<MountClaim<'_>> {
        self.commit(|state| {
            if !state.snapshots.contains_key(&id) {
                return Err(SnapError::snapshot_not_found(id));
            }
            if state
                .mounts
                .iter()
                .any(|m| m.snapshot == id && &m.destination == destination)
            {
                return Err(SnapError::MountConflict {
                    snapshot: id,
                    destination: destination.clone(),
                });
            }
            state.mounts.push(MountPoint {
                snapshot: id,
                destination: destination.clone(),
                mount_path: mount_path.to_string(),
                access,
                lease: LeaseState::Pending,
                mounted_at: now(),
            });
            Ok(())
        })?;
        Ok(MountClaim {
            registry: self,
            snapshot: id,
            destination: destination.clone(),
            armed: true,
        })
    }

    pub fn mounts(&self, id: SnapshotId) -> Vec<MountPoint> {
        self.read(|s| s.mounts.iter().filter(|m| m.snapshot == id).cloned().collect())
    }

    pub fn mount_point(&self, id: SnapshotId, destination: &Destination) -> Option<MountPoint> {
        self.read(|s| {
            s.mounts
                .iter()
                .find(|m| m.snapshot == id && &m.destination == destination)
                .cloned()
        })
    }

    pub fn all_mounts(&self) -> Vec<MountPoint> {
        self.read(|s| s.mounts.clone())
    }

    /// Removes the mount point and moves the snapshot out of MOUNTED once
    /// no active mount remains.
    pub fn complete_unmount(
        &self,
        id: SnapshotId,
        destination: &Destination,
        correlation: Option<Uuid>,
    ) -> SnapResult<Snapshot> {
        self.commit(|state| {
            state
                .mounts
                .retain(|m| !(m.snapshot == id && &m.destination == destination));
            let still_mounted = state
                .mounts
                .iter()
                .any(|m| m.snapshot == id && m.lease == LeaseState::Active);
            let current = state
                .snapshots
                .get(&id)
                .cloned()
                .ok_or_else(|| SnapError::snapshot_not_found(id))?;
            if current.state == SnapshotState::Mounted && !still_mounted {
                apply_event(
                    state,
                    id,
                    Some(SnapshotState::Mounted),
                    SnapshotEvent::Unmount,
                    correlation,
                )
            } else {
                Ok(current)
            }
        })
    }

    fn release_claim(&self, id: SnapshotId, destination: &Destination) -> SnapResult<()> {
        self.commit(|state| {
            state.mounts.retain(|m| {
                !(m.snapshot == id && &m.destination == destination && m.lease == LeaseState::Pending)
            });
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Dependency edges
    // ---------------------------------------------------------------------

    /// Opens an IN_PROGRESS edge from `source` to `derived_copy`, replacing
    /// any finished edge for the same pair.
    pub fn open_edge(&self, source: SnapshotId, derived_copy: CopyId) -> SnapResult<DependencyEdge> {
        self.commit(|state| {
            let source_copy = state
                .snapshots
                .get(&source)
                .map(|s| s.copy)
                .ok_or_else(|| SnapError::snapshot_not_found(source))?;
            if find_copy(state, derived_copy).is_none() {
                return Err(SnapError::copy_not_found(derived_copy));
            }
            if let Some(open) = state
                .edges
                .iter()
                .find(|e| e.source_snapshot == source && e.derived_copy == derived_copy && e.is_blocking())
            {
                return Err(SnapError::DependencyBlocked {
                    snapshot: source,
                    derived_copy: open.derived_copy,
                    derived_snapshot: open.derived_snapshot,
                });
            }
            state
                .edges
                .retain(|e| !(e.source_snapshot == source && e.derived_copy == derived_copy));
            let edge = DependencyEdge {
                source_copy,
                source_snapshot: source,
                derived_copy,
                derived_snapshot: None,
                state: EdgeState::InProgress,
                opened_at: now(),
            };
            state.edges.push(edge.clone());
            Ok(edge)
        })
    }

    /// Records the derived snapshot and/or final state of an edge.
    pub fn update_edge(
        &self,
        source: SnapshotId,
        derived_copy: CopyId,
        derived_snapshot: Option<SnapshotId>,
        edge_state: EdgeState,
    ) -> SnapResult<DependencyEdge> {
        self.commit(|state| {
            let edge = state
                .edges
                .iter_mut()
                .find(|e| e.source_snapshot == source && e.derived_copy == derived_copy)
                .ok_or_else(|| SnapError::snapshot_not_found(source))?;
            if derived_snapshot.is_some() {
                edge.derived_snapshot = derived_snapshot;
            }
            edge.state = edge_state;
            Ok(edge.clone())
        })
    }

    pub fn edges_from(&self, source: SnapshotId) -> Vec<DependencyEdge> {
        self.read(|s| {
            s.edges
                .iter()
                .filter(|e| e.source_snapshot == source)
                .cloned()
                .collect()
        })
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.read(|s| s.edges.clone())
    }

    /// First IN_PROGRESS edge leaving `source`, if any.
    pub fn blocking_edge(&self, source: SnapshotId) -> Option<DependencyEdge> {
        self.read(|s| {
            s.edges
                .iter()
                .find(|e| e.source_snapshot == source && e.is_blocking())
                .cloned()
        })
    }

    /// Fails with `DependencyBlocked` when `source` has an IN_PROGRESS edge.
    pub fn ensure_unblocked(&self, source: SnapshotId) -> SnapResult<()> {
        match self.blocking_edge(source) {
            Some(edge) => Err(SnapError::DependencyBlocked {
                snapshot: source,
                derived_copy: edge.derived_copy,
                derived_snapshot: edge.derived_snapshot,
            }),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    /// Takes the per-snapshot lease for `operation`.
    ///
    /// # Errors
    /// `RevertInProgress` if the chain is being reverted,
    /// `OperationInProgress` if the snapshot is already leased.
    pub fn try_lease(&self, id: SnapshotId, operation: Operation) -> SnapResult<SnapshotLease> {
        let volume = self.get(id)?.volume_key();
        self.locks.acquire(id, volume, operation)
    }

    /// Takes the volume-exclusive lease used by revert.
    pub fn try_lease_volume(&self, id: SnapshotId) -> SnapResult<SnapshotLease> {
        let volume = self.get(id)?.volume_key();
        self.locks.acquire_volume(id, volume)
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    // ---------------------------------------------------------------------
    // Audit
    // ---------------------------------------------------------------------

    /// Reads the audit log back from the store.
    pub fn audit(&self) -> SnapResult<AuditLog> {
        Ok(AuditLog::from_records(self.store.load_audit()?))
    }

    /// Verifies the audit log's hash chain and that it ends at the head
    /// recorded in the registry document. Returns the number of records.
    ///
    /// # Errors
    /// `AuditBroken` naming the first record that does not verify.
    pub fn verify_audit(&self) -> SnapResult<usize> {
        let state = self.state.read();
        let log = AuditLog::from_records(self.store.load_audit()?);
        log.verify_against(&state.audit_head)
            .map_err(|IntegrityViolation { seq }| SnapError::AuditBroken { seq })?;
        Ok(log.len())
    }

    // ---------------------------------------------------------------------
    // Compaction
    // ---------------------------------------------------------------------

    /// Drops snapshots that retired before `cutoff`, along with the edges
    /// and finished jobs nothing refers to any more. Failed edges opened
    /// before `cutoff` go too. IN_PROGRESS edges and whatever they name are
    /// always kept.
    pub fn compact(&self, cutoff: DateTime<Utc>) -> SnapResult<CompactionReport> {
        let mut preview = self.export();
        if compact_state(&mut preview, cutoff).is_empty() {
            return Ok(CompactionReport::default());
        }
        let report = self.commit(|state| Ok(compact_state(state, cutoff)))?;
        tracing::info!(
            snapshots = report.snapshots,
            edges = report.edges,
            jobs = report.jobs,
            %cutoff,
            "Registry compacted"
        );
        Ok(report)
    }
}

/// PENDING mount claim; released on drop unless [`MountClaim::complete`]
/// turns it into an ACTIVE mount point.
#[must_use = "dropping the claim releases the mount slot"]
pub struct MountClaim<'a> {
    registry: &'a SnapshotRegistry,
    snapshot: SnapshotId,
    destination: Destination,
    armed: bool,
}

impl MountClaim<'_> {
    /// Activates the mount point and moves the snapshot from `expected` to
    /// MOUNTED in one commit.
    pub fn complete(
        mut self,
        expected: SnapshotState,
        correlation: Option<Uuid>,
    ) -> SnapResult<(Snapshot, MountPoint)> {
        let id = self.snapshot;
        let destination = self.destination.clone();
        let out = self.registry.commit(|state| {
            let snap = apply_event(state, id, Some(expected), SnapshotEvent::Mount, correlation)?;
            let mount = state
                .mounts
                .iter_mut()
                .find(|m| m.snapshot == id && m.destination == destination)
                .ok_or_else(|| SnapError::ValidationFailure {
                    operation: Operation::Mount,
                    snapshot: id,
                    reason: format!("mount claim for {destination} disappeared"),
                })?;
            mount.lease = LeaseState::Active;
            mount.mounted_at = now();
            Ok((snap, mount.clone()))
        })?;
        self.armed = false;
        Ok(out)
    }
}

impl Drop for MountClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.registry.release_claim(self.snapshot, &self.destination) {
                tracing::warn!(
                    snapshot = %self.snapshot,
                    destination = %self.destination,
                    error = %e,
                    "Failed to release pending mount claim"
                );
            }
        }
    }
}

fn find_copy(state: &RegistryState, id: CopyId) -> Option<&PolicyCopy> {
    state.policies.values().find_map(|p| p.copy(id))
}

fn snapshot_mut(state: &mut RegistryState, id: SnapshotId) -> SnapResult<&mut Snapshot> {
    state
        .snapshots
        .get_mut(&id)
        .ok_or_else(|| SnapError::snapshot_not_found(id))
}

fn apply_event(
    state: &mut RegistryState,
    id: SnapshotId,
    expected: Option<SnapshotState>,
    event: SnapshotEvent,
    correlation: Option<Uuid>,
) -> SnapResult<Snapshot> {
    let snap = snapshot_mut(state, id)?;
    let from = snap.state;
    if expected.is_some_and(|e| e != from) {
        return Err(SnapError::InvalidTransition {
            snapshot: id,
            from,
            event,
        });
    }
    let to = state_machine::validate(from, event, snap.prior_state).ok_or(
        SnapError::InvalidTransition {
            snapshot: id,
            from,
            event,
        },
    )?;
    snap.prior_state = match event {
        SnapshotEvent::BeginDelete => Some(from),
        _ => None,
    };
    snap.state = to;
    if to.is_terminal() {
        snap.retired_at = Some(now());
    }
    let updated = snap.clone();
    let record = state.audit_head.link(id, event, from, to, correlation);
    state.pending_audit.push(record);
    tracing::debug!(snapshot = %id, %event, %from, %to, "Snapshot transition");
    Ok(updated)
}

/// The revert target plus every snapshot after it on the same chain.
fn revertible(state: &RegistryState, id: SnapshotId) -> SnapResult<(Snapshot, Vec<Snapshot>)> {
    let target = state
        .snapshots
        .get(&id)
        .cloned()
        .ok_or_else(|| SnapError::snapshot_not_found(id))?;
    if !state_machine::allows(target.state, SnapshotEvent::Revert) {
        return Err(SnapError::InvalidTransition {
            snapshot: id,
            from: target.state,
            event: SnapshotEvent::Revert,
        });
    }
    let later: Vec<Snapshot> = state
        .snapshots
        .values()
        .filter(|s| {
            s.copy == target.copy
                && s.volume == target.volume
                && (s.point_in_time, s.id) > (target.point_in_time, target.id)
        })
        .cloned()
        .collect();
    if let Some(mounted) = later.iter().find(|s| s.state == SnapshotState::Mounted) {
        return Err(SnapError::InvalidTransition {
            snapshot: mounted.id,
            from: mounted.state,
            event: SnapshotEvent::Invalidate,
        });
    }
    Ok((target, later))
}

fn compact_state(state: &mut RegistryState, cutoff: DateTime<Utc>) -> CompactionReport {
    let pinned: HashSet<SnapshotId> = state
        .edges
        .iter()
        .filter(|e| e.is_blocking())
        .flat_map(|e| std::iter::once(e.source_snapshot).chain(e.derived_snapshot))
        .collect();
    let before = state.snapshots.len();
    state.snapshots.retain(|id, s| {
        let expired = s.state.is_terminal() && s.retired_at.unwrap_or(s.created_at) < cutoff;
        !expired || pinned.contains(id)
    });
    let snapshots = before - state.snapshots.len();

    let before = state.edges.len();
    let live = &state.snapshots;
    state.edges.retain(|e| {
        if e.is_blocking() {
            return true;
        }
        if e.state == EdgeState::Failed && e.opened_at < cutoff {
            return false;
        }
        live.contains_key(&e.source_snapshot)
            && e.derived_snapshot.map_or(true, |d| live.contains_key(&d))
    });
    let edges = before - state.edges.len();

    let referenced: HashSet<JobId> = state.snapshots.values().map(|s| s.job).collect();
    let before = state.jobs.len();
    state.jobs.retain(|id, job| {
        let finished = job.status.is_terminal() && job.ended_at.is_some_and(|t| t < cutoff);
        !finished || referenced.contains(id)
    });
    let jobs = before - state.jobs.len();

    CompactionReport {
        snapshots,
        edges,
        jobs,
    }
}

fn validate_policy(state: &RegistryState, policy: &StoragePolicy) -> SnapResult<()> {
    let bad = |msg: String| Err(SnapError::Config(format!("storage policy '{}': {msg}", policy.name)));
    if policy.copies.is_empty() {
        return bad("has no copies".into());
    }
    if policy.first_of_kind(CopyKind::Primary).is_none() {
        return bad("has no primary copy".into());
    }
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for copy in &policy.copies {
        if copy.policy != policy.id {
            return bad(format!("copy '{}' belongs to {}", copy.name, copy.policy));
        }
        if !ids.insert(copy.id) {
            return bad(format!("duplicate copy id {}", copy.id));
        }
        if !names.insert(copy.name.to_ascii_lowercase()) {
            return bad(format!("duplicate copy name '{}'", copy.name));
        }
        let owner = state
            .policies
            .values()
            .find(|p| p.id != policy.id && p.copy(copy.id).is_some());
        if let Some(owner) = owner {
            return bad(format!("copy id {} is already used by '{}'", copy.id, owner.name));
        }
    }
    if let Some(source) = policy.backup_copy_source {
        match policy.copy(source) {
            None => return bad(format!("backup copy source {source} is not a copy of this policy")),
            Some(c) if c.kind == CopyKind::BackupCopy => {
                return bad("backup copy source cannot be the backup copy itself".into());
            }
            Some(_) => {}
        }
    }
    Ok(())
}
