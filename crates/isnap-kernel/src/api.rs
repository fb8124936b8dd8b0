//! Collaborator seams: the array control plane, its job manager, and the
//! catalog service. The lifecycle only ever reaches the outside world
//! through these traits.

use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Failure to even submit a request to the array.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArrayError {
    /// Transient; worth retrying
    #[error("array unreachable: {0}")]
    Communication(String),

    /// The array refused the request outright
    #[error("array rejected request: {0}")]
    Rejected(String),
}

impl ArrayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ArrayError::Communication(_))
    }
}

/// Pollable job submitted to the array/job manager
#[async_trait]
pub trait JobHandle: Send + Sync {
    fn job_id(&self) -> ArrayJobId;

    /// Waits until the job reaches a terminal status. Returns `false` when
    /// `timeout` elapsed first.
    async fn wait_for_completion(&self, timeout: Duration) -> bool;

    async fn status(&self) -> JobStatus;

    /// Why the job is delayed or failed, as reported by the job manager
    async fn delay_reason(&self) -> String;

    async fn kill(&self);
}

pub type Job = Arc<dyn JobHandle>;

/// A submitted job that will produce an array-side handle.
pub struct SnapshotJob {
    pub handle: ArrayHandle,
    pub job: Job,
}

impl std::fmt::Debug for SnapshotJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotJob")
            .field("handle", &self.handle)
            .field("job", &self.job.job_id())
            .finish()
    }
}

/// Array vendor control plane
#[async_trait]
pub trait ArrayClient: Send + Sync {
    async fn create_snapshot(&self, volume: &str) -> Result<SnapshotJob, ArrayError>;

    async fn mount_snapshot(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
        mount_path: &str,
        access: AccessMode,
    ) -> Result<Job, ArrayError>;

    async fn unmount_snapshot(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
        force: bool,
    ) -> Result<Job, ArrayError>;

    async fn revert_snapshot(&self, handle: &ArrayHandle) -> Result<Job, ArrayError>;

    async fn delete_snapshot(&self, handle: &ArrayHandle, force: bool) -> Result<Job, ArrayError>;

    /// Replicates to the array backing `destination`; the new snapshot's
    /// handle is known up front.
    async fn replicate_snapshot(
        &self,
        handle: &ArrayHandle,
        destination: CopyId,
    ) -> Result<SnapshotJob, ArrayError>;

    /// Streams snapshot content into conventional backup-copy media.
    async fn materialize_backup_copy(
        &self,
        handle: &ArrayHandle,
        destination: CopyId,
    ) -> Result<SnapshotJob, ArrayError>;

    async fn snapshot_exists(&self, handle: &ArrayHandle) -> Result<bool, ArrayError>;

    async fn is_mounted(
        &self,
        handle: &ArrayHandle,
        destination: &Destination,
    ) -> Result<bool, ArrayError>;
}

/// Indexes snapshot content so it becomes browsable and restorable
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn catalog(&self, copy: CopyId, snapshots: &[SnapshotId]) -> Result<Job, ArrayError>;
}
