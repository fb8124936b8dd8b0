//! Reverting a source volume to a snapshot.
//!
//! Revert is destructive: every later snapshot on the same volume chain
//! stops describing reachable data and goes STALE in the same registry
//! commit that marks the target REVERTED.

use crate::context::OperationContext;
use async_trait::async_trait;
use isnap_kernel::api::ArrayClient;
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::registry::{RevertOutcome, SnapshotRegistry};
use isnap_kernel::scheduler::run_array_job;
use isnap_kernel::types::*;
use std::sync::Arc;

#[async_trait]
pub trait RevertController: Send + Sync {
    /// # Errors
    /// `InvalidTransition` unless the snapshot is CATALOGED or UNMOUNTED and
    /// no later snapshot on its volume is MOUNTED,
    /// `RevertInProgress`/`OperationInProgress` when the chain is busy,
    /// `DependencyBlocked` while an aux or backup copy still reads from it.
    async fn revert(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<RevertOutcome>;
}

pub struct ArrayRevertController {
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
}

impl ArrayRevertController {
    pub fn new(registry: Arc<SnapshotRegistry>, array: Arc<dyn ArrayClient>) -> Self {
        Self { registry, array }
    }

    /// Everything that would make the registry refuse the revert is checked
    /// here, before the array touches the volume.
    fn precheck(&self, snapshot: SnapshotId) -> SnapResult<Snapshot> {
        let snap = self.registry.ensure_revertible(snapshot)?;
        self.registry.ensure_unblocked(snapshot)?;
        Ok(snap)
    }
}

#[async_trait]
impl RevertController for ArrayRevertController {
    async fn revert(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<RevertOutcome> {
        ctx.check_cancelled()?;
        self.precheck(snapshot)?;
        let _lease = self.registry.try_lease_volume(snapshot)?;
        // State may have moved between the first read and the lease.
        let snap = self.precheck(snapshot)?;
        let handle = snap.handle.as_ref().ok_or_else(|| SnapError::ValidationFailure {
            operation: Operation::Revert,
            snapshot,
            reason: "snapshot has no array handle".to_string(),
        })?;

        tracing::info!(
            snapshot = %snapshot,
            volume = %snap.volume_key(),
            correlation = %ctx.correlation,
            "Reverting volume"
        );
        let array = &*self.array;
        run_array_job(&ctx.retry, Operation::Revert, Some(snapshot), ctx.timeout, move || {
            array.revert_snapshot(handle)
        })
        .await?;

        let outcome = self.registry.revert_chain(snapshot, ctx.correlation())?;
        tracing::info!(
            snapshot = %snapshot,
            invalidated = outcome.invalidated.len(),
            correlation = %ctx.correlation,
            "Volume reverted"
        );
        Ok(outcome)
    }
}
