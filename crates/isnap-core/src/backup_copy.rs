//! Materializing snapshots into a policy's conventional BackupCopy.

use crate::context::OperationContext;
use crate::copy::{derive_snapshot, pending_sources, CopiedSnapshot, CopyReport};
use async_trait::async_trait;
use isnap_kernel::api::{ArrayClient, CatalogService};
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::types::*;
use std::sync::Arc;

#[async_trait]
pub trait BackupCopyEngine: Send + Sync {
    /// Materializes every restorable snapshot of the source copy that the
    /// BackupCopy does not hold yet, then catalogs the results.
    ///
    /// The source is `source` when given, else the policy's configured
    /// backup-copy source, else its Primary copy.
    ///
    /// # Errors
    /// `BackupCopyFailed` as soon as one materialization job ends in
    /// anything but Completed. Not retried; earlier entries stay cataloged.
    async fn backup_copy(
        &self,
        ctx: &OperationContext,
        policy: StoragePolicyId,
        source: Option<CopyId>,
    ) -> SnapResult<CopyReport>;
}

pub struct ArrayBackupCopyEngine {
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
    catalog: Arc<dyn CatalogService>,
}

impl ArrayBackupCopyEngine {
    pub fn new(
        registry: Arc<SnapshotRegistry>,
        array: Arc<dyn ArrayClient>,
        catalog: Arc<dyn CatalogService>,
    ) -> Self {
        Self {
            registry,
            array,
            catalog,
        }
    }

    fn endpoints(&self, policy: &StoragePolicy, source: Option<CopyId>) -> SnapResult<(CopyId, CopyId)> {
        let source = match source.or(policy.backup_copy_source) {
            Some(copy) => policy
                .copy(copy)
                .map(|c| c.id)
                .ok_or_else(|| {
                    SnapError::Config(format!("copy {copy} is not part of policy '{}'", policy.name))
                })?,
            None => policy
                .first_of_kind(CopyKind::Primary)
                .map(|c| c.id)
                .ok_or_else(|| SnapError::Config(format!("policy '{}' has no primary copy", policy.name)))?,
        };
        let destination = policy
            .first_of_kind(CopyKind::BackupCopy)
            .map(|c| c.id)
            .ok_or_else(|| SnapError::Config(format!("policy '{}' has no backup copy", policy.name)))?;
        if source == destination {
            return Err(SnapError::Config("backup copy cannot read from itself".into()));
        }
        Ok((source, destination))
    }
}

#[async_trait]
impl BackupCopyEngine for ArrayBackupCopyEngine {
    async fn backup_copy(
        &self,
        ctx: &OperationContext,
        policy: StoragePolicyId,
        source: Option<CopyId>,
    ) -> SnapResult<CopyReport> {
        let storage_policy = self.registry.policy(policy)?;
        let (source, destination) = self.endpoints(&storage_policy, source)?;
        let (pending, skipped) = pending_sources(&self.registry, source, destination);
        let mut report = CopyReport::new(source, destination);
        report.skipped = skipped;
        tracing::info!(
            policy = %policy,
            source = %source,
            destination = %destination,
            pending = pending.len(),
            correlation = %ctx.correlation,
            "Backup copy started"
        );

        for snap in &pending {
            let derived = derive_snapshot(
                &self.registry,
                &*self.array,
                &*self.catalog,
                ctx,
                snap.id,
                destination,
                Operation::Materialize,
            )
            .await
            .map_err(|err| match err {
                SnapError::JobFailed {
                    job, status, reason, ..
                } => SnapError::BackupCopyFailed {
                    policy,
                    job,
                    status,
                    reason,
                },
                other => other,
            });
            match derived {
                Ok(entry) => report.copied.push(CopiedSnapshot {
                    source: snap.id,
                    derived: entry.id,
                }),
                Err(err) => {
                    tracing::error!(
                        policy = %policy,
                        snapshot = %snap.id,
                        kind = err.kind().as_str(),
                        error = %err,
                        "Backup copy aborted"
                    );
                    return Err(err);
                }
            }
        }

        tracing::info!(
            policy = %policy,
            destination = %destination,
            copied = report.copied.len(),
            "Backup copy finished"
        );
        Ok(report)
    }
}
