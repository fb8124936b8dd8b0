//! Deleting snapshots from a copy, with verification that the array
//! really let go of them.

use crate::config::VerifyPolicy;
use crate::context::OperationContext;
use crate::mount::MountController;
use async_trait::async_trait;
use isnap_kernel::api::ArrayClient;
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::scheduler::{poll_until, run_array_job};
use isnap_kernel::state_machine;
use isnap_kernel::types::*;
use std::sync::Arc;

#[async_trait]
pub trait DeleteController: Send + Sync {
    /// Deletes a CATALOGED, UNMOUNTED or STALE snapshot. Returns the
    /// registry read-back, which is always DELETED on success.
    ///
    /// # Errors
    /// `DependencyBlocked` while a derived copy is still being produced
    /// from the snapshot; `ValidationFailure` when the array keeps
    /// reporting the snapshot after the verification budget, in which case
    /// it is left DELETING for reconcile.
    async fn delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot>;

    /// Force-unmounts every destination first, then deletes with the
    /// array's force flag.
    async fn force_delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot>;
}

pub struct ArrayDeleteController {
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
    mounts: Arc<dyn MountController>,
    verify: VerifyPolicy,
}

impl ArrayDeleteController {
    pub fn new(
        registry: Arc<SnapshotRegistry>,
        array: Arc<dyn ArrayClient>,
        mounts: Arc<dyn MountController>,
        verify: VerifyPolicy,
    ) -> Self {
        Self {
            registry,
            array,
            mounts,
            verify,
        }
    }

    /// Moves the snapshot to DELETING, or accepts it already there.
    fn begin(&self, ctx: &OperationContext, snap: Snapshot) -> SnapResult<Snapshot> {
        match snap.state {
            SnapshotState::Deleting => {
                tracing::info!(snapshot = %snap.id, "Resuming interrupted delete");
                Ok(snap)
            }
            state if state_machine::allows(state, SnapshotEvent::BeginDelete) => {
                if !self.registry.mounts(snap.id).is_empty() {
                    // A mount claim is still in flight.
                    return Err(SnapError::OperationInProgress {
                        snapshot: snap.id,
                        operation: Operation::Mount,
                    });
                }
                self.registry.compare_and_transition(
                    snap.id,
                    state,
                    SnapshotEvent::BeginDelete,
                    ctx.correlation(),
                )
            }
            state => Err(SnapError::InvalidTransition {
                snapshot: snap.id,
                from: state,
                event: SnapshotEvent::BeginDelete,
            }),
        }
    }

    fn abort(&self, ctx: &OperationContext, snapshot: SnapshotId, cause: &SnapError) {
        match self
            .registry
            .transition(snapshot, SnapshotEvent::AbortDelete, ctx.correlation())
        {
            Ok(snap) => tracing::warn!(
                snapshot = %snapshot,
                state = %snap.state,
                error = %cause,
                "Delete failed, snapshot rolled back"
            ),
            Err(err) => tracing::error!(
                snapshot = %snapshot,
                error = %cause,
                rollback_error = %err,
                "Delete failed and could not be rolled back"
            ),
        }
    }

    async fn delete_with(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        force: bool,
    ) -> SnapResult<Snapshot> {
        ctx.check_cancelled()?;
        let snap = self.registry.get(snapshot)?;
        if snap.state == SnapshotState::Deleted {
            tracing::warn!(snapshot = %snapshot, "Snapshot already deleted");
            return Ok(snap);
        }
        self.registry.ensure_unblocked(snapshot)?;
        let _lease = self.registry.try_lease(snapshot, Operation::Delete)?;
        // An aux copy may have opened an edge between the check and the lease.
        self.registry.ensure_unblocked(snapshot)?;

        let snap = self.registry.get(snapshot)?;
        if snap.state == SnapshotState::Deleted {
            return Ok(snap);
        }
        let snap = self.begin(ctx, snap)?;

        if let Some(handle) = &snap.handle {
            let array = &*self.array;
            let submitted = run_array_job(&ctx.retry, Operation::Delete, Some(snapshot), ctx.timeout, move || {
                array.delete_snapshot(handle, force)
            })
            .await;
            if let Err(err) = submitted {
                self.abort(ctx, snapshot, &err);
                return Err(err);
            }

            let gone = poll_until(self.verify.attempts, self.verify.interval(), move || async move {
                array.snapshot_exists(handle).await.map(|exists| !exists)
            })
            .await;
            if !gone {
                tracing::error!(
                    snapshot = %snapshot,
                    handle = %handle,
                    polls = self.verify.attempts,
                    "Array still reports deleted snapshot"
                );
                return Err(SnapError::ValidationFailure {
                    operation: Operation::Delete,
                    snapshot,
                    reason: format!(
                        "array still reports {handle} after {} verification polls",
                        self.verify.attempts
                    ),
                });
            }
        }

        self.registry.compare_and_transition(
            snapshot,
            SnapshotState::Deleting,
            SnapshotEvent::ConfirmDelete,
            ctx.correlation(),
        )?;
        let read_back = self.registry.get(snapshot)?;
        if read_back.state != SnapshotState::Deleted {
            return Err(SnapError::ValidationFailure {
                operation: Operation::Delete,
                snapshot,
                reason: format!("registry reads back {} after confirm", read_back.state),
            });
        }
        tracing::info!(
            snapshot = %snapshot,
            copy = %read_back.copy,
            force,
            correlation = %ctx.correlation,
            "Snapshot deleted"
        );
        Ok(read_back)
    }
}

#[async_trait]
impl DeleteController for ArrayDeleteController {
    async fn delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot> {
        self.delete_with(ctx, snapshot, false).await
    }

    async fn force_delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot> {
        let unmounted = self.mounts.force_unmount(ctx, snapshot).await?;
        if unmounted > 0 {
            tracing::info!(snapshot = %snapshot, unmounted, "Cleared mounts before force delete");
        }
        self.delete_with(ctx, snapshot, true).await
    }
}
