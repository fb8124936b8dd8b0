//! In-process stand-in for the array control plane and catalog service.
//!
//! Jobs complete instantly by default. Tests shape behaviour per operation
//! with fault injection: transient submission failures, stalled jobs that
//! never finish, gated jobs held until released, non-Completed outcomes,
//! and deletes the array keeps reporting for a while.

use crate::api::*;
use crate::types::*;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Effect = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
enum Behaviour {
    Complete,
    Stall,
    Gated(watch::Receiver<bool>),
}

/// A job handed out by the simulator
pub struct SimJob {
    id: ArrayJobId,
    behaviour: Behaviour,
    outcome: (JobStatus, String),
    effect: Mutex<Option<Effect>>,
    finished: AtomicBool,
    killed: AtomicBool,
}

impl SimJob {
    fn new(id: ArrayJobId, behaviour: Behaviour, outcome: (JobStatus, String), effect: Option<Effect>) -> Self {
        Self {
            id,
            behaviour,
            outcome,
            effect: Mutex::new(effect),
            finished: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.outcome.0 == JobStatus::Completed {
            if let Some(effect) = self.effect.lock().take() {
                effect();
            }
        }
    }
}

#[async_trait]
impl JobHandle for SimJob {
    fn job_id(&self) -> ArrayJobId {
        self.id
    }

    async fn wait_for_completion(&self, timeout: Duration) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return true;
        }
        match &self.behaviour {
            Behaviour::Complete => {}
            Behaviour::Stall => {
                tokio::time::sleep(timeout).await;
                return false;
            }
            Behaviour::Gated(rx) => {
                let mut rx = rx.clone();
                let opened = tokio::time::timeout(timeout, rx.wait_for(|open| *open))
                    .await
                    .is_ok_and(|r| r.is_ok());
                if !opened {
                    return false;
                }
            }
        }
        self.finish();
        true
    }

    async fn status(&self) -> JobStatus {
        if self.killed.load(Ordering::SeqCst) {
            JobStatus::Killed
        } else if self.finished.load(Ordering::SeqCst) {
            self.outcome.0
        } else {
            JobStatus::Running
        }
    }

    async fn delay_reason(&self) -> String {
        if self.killed.load(Ordering::SeqCst) {
            "job was killed".to_string()
        } else {
            self.outcome.1.clone()
        }
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// Releases jobs held by [`SimulatedArray::gate`]
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone, Default)]
struct SimSnapshot {
    volume: String,
    deleted: bool,
    // Existence reads that still report the snapshot after delete
    linger: u32,
}

#[derive(Default)]
struct Faults {
    fail_next: DashMap<Operation, u32>,
    stalled: DashMap<Operation, ()>,
    gates: DashMap<Operation, Arc<watch::Sender<bool>>>,
    outcomes: DashMap<Operation, (JobStatus, String)>,
    calls: DashMap<Operation, u32>,
}

impl Faults {
    fn enter(&self, op: Operation) -> Result<(), ArrayError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(mut remaining) = self.fail_next.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ArrayError::Communication(format!(
                    "simulated {op} communication failure"
                )));
            }
        }
        Ok(())
    }

    fn behaviour(&self, op: Operation) -> Behaviour {
        if self.stalled.contains_key(&op) {
            Behaviour::Stall
        } else if let Some(tx) = self.gates.get(&op) {
            Behaviour::Gated(tx.subscribe())
        } else {
            Behaviour::Complete
        }
    }

    fn outcome(&self, op: Operation) -> (JobStatus, String) {
        self.outcomes
            .get(&op)
            .map(|o| o.clone())
            .unwrap_or((JobStatus::Completed, String::new()))
    }
}

#[derive(Default)]
struct SimState {
    next_job: AtomicU64,
    snapshots: DashMap<ArrayHandle, SimSnapshot>,
    mounts: DashMap<(ArrayHandle, Destination), String>,
    linger_after_delete: AtomicU32,
    hide_mounts: AtomicBool,
    faults: Faults,
}

/// Simulated array
#[derive(Clone, Default)]
pub struct SimulatedArray {
    state: Arc<SimState>,
}

impl SimulatedArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `n` submissions of `op` fail with a transient error.
    /// `Operation::Reconcile` covers existence reads.
    pub fn fail_next(&self, op: Operation, n: u32) {
        self.state.faults.fail_next.insert(op, n);
    }

    /// Jobs for `op` never complete until [`Self::clear`].
    pub fn stall(&self, op: Operation) {
        self.state.faults.stalled.insert(op, ());
    }

    /// Jobs for `op` submitted from now on wait for the returned gate.
    pub fn gate(&self, op: Operation) -> Gate {
        let (tx, _rx) = watch::channel(false);
        let tx = Arc::new(tx);
        self.state.faults.gates.insert(op, Arc::clone(&tx));
        Gate { tx }
    }

    /// Jobs for `op` end with `status` and `reason`.
    pub fn job_outcome(&self, op: Operation, status: JobStatus, reason: &str) {
        self.state
            .faults
            .outcomes
            .insert(op, (status, reason.to_string()));
    }

    /// Removes every fault configured for `op`.
    pub fn clear(&self, op: Operation) {
        let f = &self.state.faults;
        f.fail_next.remove(&op);
        f.stalled.remove(&op);
        if let Some((_, tx)) = f.gates.remove(&op) {
            tx.send_replace(true);
        }
        f.outcomes.remove(&op);
    }

    /// Deleted snapshots keep showing up for `polls` existence reads.
    pub fn linger_after_delete(&self, polls: u32) {
        self.state.linger_after_delete.store(polls, Ordering::SeqCst);
    }

    /// Makes mount verification reads report nothing mounted.
    pub fn hide_mounts(&self, hide: bool) {
        self.state.hide_mounts.store(hide, Ordering::SeqCst);
    }

    /// Deletes a snapshot behind the lifecycle's back.
    pub fn remove_out_of_band(&self, handle: &ArrayHandle) {
        self.state.mounts.retain(|(h, _), _| h != handle);
        self.state
            .snapshots
            .entry(handle.clone())
            .or_default()
            .deleted = true;
    }

    /// Submissions (including failed ones) seen for `op`.
    pub fn calls(&self, op: Operation) -> u32 {
        self.state.faults.calls.get(&op).map_or(0, |c| *c)
    }

    pub fn exists(&self, handle: &ArrayHandle) -> bool {
        self.state
            .snapshots
            .get(handle)
            .map_or(true, |s| !s.deleted)
    }

    pub fn mounted_on(&self, handle: &ArrayHandle, destination: &Destination) -> bool {
        self.state
            .mounts
            .contains_key(&(handle.clone(), destination.clone()))
    }

    pub fn volume_of(&self, handle: &ArrayHandle) -> Option<String> {
        self.state.snapshots.get(handle).map(|s| s.volume.clone())
    }

    fn new_handle(&self, prefix: &str) -> ArrayHandle {
        // Unique across simulator instances: separate CLI runs share one
        // durable registry.
        ArrayHandle(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
    }

    fn job(&self, op: Operation, effect: Option<Effect>) -> Arc<SimJob> {
        let id = ArrayJobId(self.state.next_job.fetch_add(1, Ordering::SeqCst) + 1);
        Arc::new(SimJob::new(
            id,
            self.state.faults.behaviour(op),
            self.state.faults.outcome(op),
            effect,
        ))
    }

    fn require(&self, handle: &ArrayHandle) -> Result<(), ArrayError> {
        if self.exists(handle) {
            Ok(())
        } else {
            Err(ArrayError::Rejected(format!("snapshot {handle} does not exist")))
        }
    }

    fn derive(&self, op: Operation, source: &ArrayHandle, prefix: &str) -> Result<SnapshotJob, ArrayError> {
        self.state.faults.enter(op)?;
        self.require(source)?;
        let volume = self.volume_of(source).unwrap_or_default();
        let handle = self.new_handle(prefix);
        let state = Arc::clone(&self.state);
        let created = handle.clone();
        let job = self.job(
            op,
            Some(Box::new(move || {
                state.snapshots.insert(
                    created,
                    SimSnapshot {
                        volume,
                        ..SimSnapshot::default()
                    },
                );
            })),
        );
        Ok(SnapshotJob { handle, job })
    }
}

#[async_trait]
impl ArrayClient for SimulatedArray {
    async fn create_snapshot(&self, volume: &str) -> Result<SnapshotJob, ArrayError> {
        self.state.faults.enter(Operation::Create)?;
        let handle = self.new_handle("snap");
        let state = Arc::clone(&self.state);
        let created = handle.clone();
        let volume = volume.to_string();
        let job = self.job(
            Operation::Create,
            Some(Box::new(move || {
                state.snapshots.insert(
                    created,
                    SimSnapshot {
                        volume,
                        ..SimSnapshot::default()
                    },
                );
            })),
        );
        Ok(SnapshotJob { handle, job })
    }

    async fn mount_snapshot(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
        mount_path: &str,
        _access: AccessMode,
    ) -> Result<Job, ArrayError> {
        self.state.faults.enter(Operation::Mount)?;
        self.require(handle)?;
        let state = Arc::clone(&self.state);
        let key = (handle.clone(), destination.clone());
        let path = mount_path.to_string();
        Ok(self.job(
            Operation::Mount,
            Some(Box::new(move || {
                state.mounts.insert(key, path);
            })),
        ))
    }

    async fn unmount_snapshot(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
        _force: bool,
    ) -> Result<Job, ArrayError> {
        self.state.faults.enter(Operation::Unmount)?;
        let state = Arc::clone(&self.state);
        let key = (handle.clone(), destination.clone());
        Ok(self.job(
            Operation::Unmount,
            Some(Box::new(move || {
                state.mounts.remove(&key);
            })),
        ))
    }

    async fn revert_snapshot(&self, handle: &ArrayHandle) -> Result<Job, ArrayError> {
        self.state.faults.enter(Operation::Revert)?;
        self.require(handle)?;
        Ok(self.job(Operation::Revert, None))
    }

    async fn delete_snapshot(&self, handle: &ArrayHandle, force: bool) -> Result<Job, ArrayError> {
        self.state.faults.enter(Operation::Delete)?;
        if !force && self.state.mounts.iter().any(|m| &m.key().0 == handle) {
            return Err(ArrayError::Rejected(format!("snapshot {handle} is mounted")));
        }
        let state = Arc::clone(&self.state);
        let target = handle.clone();
        let linger = self.state.linger_after_delete.load(Ordering::SeqCst);
        Ok(self.job(
            Operation::Delete,
            Some(Box::new(move || {
                state.mounts.retain(|(h, _), _| h != &target);
                let mut snap = state.snapshots.entry(target).or_default();
                snap.deleted = true;
                snap.linger = linger;
            })),
        ))
    }

    async fn replicate_snapshot(
        &self,
        handle: &ArrayHandle,
        _destination: CopyId,
    ) -> Result<SnapshotJob, ArrayError> {
        self.derive(Operation::Replicate, handle, "replica")
    }

    async fn materialize_backup_copy(
        &self,
        handle: &ArrayHandle,
        _destination: CopyId,
    ) -> Result<SnapshotJob, ArrayError> {
        self.derive(Operation::Materialize, handle, "media")
    }

    async fn snapshot_exists(&self, handle: &ArrayHandle) -> Result<bool, ArrayError> {
        // Existence reads share the Reconcile fault slot.
        self.state.faults.enter(Operation::Reconcile)?;
        let Some(mut snap) = self.state.snapshots.get_mut(handle) else {
            return Ok(true);
        };
        if snap.deleted && snap.linger > 0 {
            snap.linger -= 1;
            return Ok(true);
        }
        Ok(!snap.deleted)
    }

    async fn is_mounted(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
    ) -> Result<bool, ArrayError> {
        if self.state.hide_mounts.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.mounted_on(handle, destination))
    }
}

/// Simulated catalog service; records every catalog request.
#[derive(Clone, Default)]
pub struct SimulatedCatalog {
    cataloged: Arc<Mutex<Vec<(CopyId, Vec<SnapshotId>)>>>,
    next_job: Arc<AtomicU64>,
    faults: Arc<Faults>,
}

impl SimulatedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.insert(Operation::Catalog, n);
    }

    pub fn job_outcome(&self, status: JobStatus, reason: &str) {
        self.faults
            .outcomes
            .insert(Operation::Catalog, (status, reason.to_string()));
    }

    pub fn clear(&self) {
        self.faults.fail_next.remove(&Operation::Catalog);
        self.faults.outcomes.remove(&Operation::Catalog);
    }

    /// Snapshots cataloged so far, in request order
    pub fn cataloged(&self) -> Vec<SnapshotId> {
        self.cataloged
            .lock()
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    pub fn calls(&self) -> u32 {
        self.faults.calls.get(&Operation::Catalog).map_or(0, |c| *c)
    }
}

#[async_trait]
impl CatalogService for SimulatedCatalog {
    async fn catalog(&self, copy: CopyId, snapshots: &[SnapshotId]) -> Result<Job, ArrayError> {
        self.faults.enter(Operation::Catalog)?;
        let id = ArrayJobId(self.next_job.fetch_add(1, Ordering::SeqCst) + 1);
        let log = Arc::clone(&self.cataloged);
        let entry = (copy, snapshots.to_vec());
        Ok(Arc::new(SimJob::new(
            id,
            self.faults.behaviour(Operation::Catalog),
            self.faults.outcome(Operation::Catalog),
            Some(Box::new(move || log.lock().push(entry))),
        )))
    }
}
