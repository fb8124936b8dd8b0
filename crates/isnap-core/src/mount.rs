//! Mounting snapshots onto destination hosts for validation and browse.

use crate::config::VerifyPolicy;
use crate::context::OperationContext;
use async_trait::async_trait;
use isnap_kernel::api::ArrayClient;
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::scheduler::{poll_until, run_array_job};
use isnap_kernel::state_machine;
use isnap_kernel::types::*;
use std::sync::Arc;

#[async_trait]
pub trait MountController: Send + Sync {
    /// Exposes a CATALOGED or UNMOUNTED snapshot on `destination`.
    ///
    /// # Errors
    /// `MountConflict` if the (snapshot, destination) pair already has a
    /// mount point, `InvalidTransition` from any other state.
    async fn mount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
        access: AccessMode,
    ) -> SnapResult<MountPoint>;

    /// Reverses [`MountController::mount`]. Returns `None` when nothing was
    /// mounted there, which is not an error.
    async fn unmount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
    ) -> SnapResult<Option<Snapshot>>;

    /// Force-unmounts every destination. Returns how many were removed.
    async fn force_unmount(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<usize>;

    fn mount_status(&self, snapshot: SnapshotId) -> SnapResult<Vec<MountPoint>>;
}

pub struct ArrayMountController {
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
    verify: VerifyPolicy,
    mount_root: String,
}

impl ArrayMountController {
    pub fn new(
        registry: Arc<SnapshotRegistry>,
        array: Arc<dyn ArrayClient>,
        verify: VerifyPolicy,
        mount_root: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            array,
            verify,
            mount_root: mount_root.into(),
        }
    }

    fn mount_path(&self, snapshot: SnapshotId) -> String {
        format!("{}/{snapshot}", self.mount_root.trim_end_matches('/'))
    }

    async fn detach(
        &self,
        ctx: &OperationContext,
        snap: &Snapshot,
        destination: &Destination,
        force: bool,
    ) -> SnapResult<Snapshot> {
        if let Some(handle) = &snap.handle {
            let array = &*self.array;
            run_array_job(&ctx.retry, Operation::Unmount, Some(snap.id), ctx.timeout, move || {
                array.unmount_snapshot(handle, destination, force)
            })
            .await?;
            let gone = poll_until(self.verify.attempts, self.verify.interval(), move || async move {
                array.is_mounted(handle, destination).await.map(|m| !m)
            })
            .await;
            if !gone {
                return Err(SnapError::ValidationFailure {
                    operation: Operation::Unmount,
                    snapshot: snap.id,
                    reason: format!("array still exposes the snapshot on {destination}"),
                });
            }
        }
        self.registry
            .complete_unmount(snap.id, destination, ctx.correlation())
    }
}

#[async_trait]
impl MountController for ArrayMountController {
    async fn mount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
        access: AccessMode,
    ) -> SnapResult<MountPoint> {
        let path = self.mount_path(snapshot);
        let claim = self
            .registry
            .claim_mount(snapshot, destination, &path, access)?;
        let _lease = self.registry.try_lease(snapshot, Operation::Mount)?;

        let snap = self.registry.get(snapshot)?;
        if !state_machine::allows(snap.state, SnapshotEvent::Mount) {
            return Err(SnapError::InvalidTransition {
                snapshot,
                from: snap.state,
                event: SnapshotEvent::Mount,
            });
        }
        let handle = snap.handle.as_ref().ok_or_else(|| SnapError::ValidationFailure {
            operation: Operation::Mount,
            snapshot,
            reason: "snapshot has no array handle".to_string(),
        })?;

        let array = &*self.array;
        let mount_path = path.as_str();
        run_array_job(&ctx.retry, Operation::Mount, Some(snapshot), ctx.timeout, move || {
            array.mount_snapshot(handle, destination, mount_path, access)
        })
        .await?;

        let visible = poll_until(self.verify.attempts, self.verify.interval(), move || async move {
            array.is_mounted(handle, destination).await
        })
        .await;
        if !visible {
            return Err(SnapError::ValidationFailure {
                operation: Operation::Mount,
                snapshot,
                reason: format!("array does not report the snapshot mounted on {destination}"),
            });
        }

        let (_, mount) = claim.complete(snap.state, ctx.correlation())?;
        self.registry.mark_validated(snapshot)?;
        tracing::info!(
            snapshot = %snapshot,
            destination = %destination,
            path = %mount.mount_path,
            correlation = %ctx.correlation,
            "Snapshot mounted"
        );
        Ok(mount)
    }

    async fn unmount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
    ) -> SnapResult<Option<Snapshot>> {
        if self.registry.mount_point(snapshot, destination).is_none() {
            tracing::debug!(snapshot = %snapshot, destination = %destination, "Nothing mounted, unmount is a no-op");
            return Ok(None);
        }
        let _lease = self.registry.try_lease(snapshot, Operation::Unmount)?;
        let snap = self.registry.get(snapshot)?;
        let snap = self.detach(ctx, &snap, destination, false).await?;
        tracing::info!(
            snapshot = %snapshot,
            destination = %destination,
            state = %snap.state,
            correlation = %ctx.correlation,
            "Snapshot unmounted"
        );
        Ok(Some(snap))
    }

    async fn force_unmount(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<usize> {
        let mounts = self.registry.mounts(snapshot);
        if mounts.is_empty() {
            return Ok(0);
        }
        let _lease = self.registry.try_lease(snapshot, Operation::Unmount)?;
        for mount in &mounts {
            let snap = self.registry.get(snapshot)?;
            self.detach(ctx, &snap, &mount.destination, true).await?;
            tracing::warn!(
                snapshot = %snapshot,
                destination = %mount.destination,
                correlation = %ctx.correlation,
                "Snapshot force unmounted"
            );
        }
        Ok(mounts.len())
    }

    fn mount_status(&self, snapshot: SnapshotId) -> SnapResult<Vec<MountPoint>> {
        self.registry.get(snapshot)?;
        Ok(self.registry.mounts(snapshot))
    }
}
