//! Replication of snapshots from one copy to a Vault or Aux copy.

use crate::context::OperationContext;
use crate::copy::{derive_snapshot, pending_sources, CopiedSnapshot, CopyReport};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use isnap_kernel::api::{ArrayClient, CatalogService};
use isnap_kernel::error::{SnapError, SnapResult, SnapshotFailure};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::types::*;
use std::sync::Arc;

#[async_trait]
pub trait AuxCopyEngine: Send + Sync {
    /// Replicates every restorable snapshot on `source` that has no live
    /// counterpart on `destination`.
    ///
    /// Best effort: a failing entry is reported in [`CopyReport::failed`]
    /// and does not stop its siblings. With `scale_out` entries run
    /// concurrently.
    ///
    /// # Errors
    /// `Config` when the copies are not a valid source/destination pair.
    async fn aux_copy(
        &self,
        ctx: &OperationContext,
        source: CopyId,
        destination: CopyId,
        scale_out: bool,
    ) -> SnapResult<CopyReport>;
}

pub struct ArrayAuxCopyEngine {
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
    catalog: Arc<dyn CatalogService>,
    parallelism: usize,
}

impl ArrayAuxCopyEngine {
    pub fn new(
        registry: Arc<SnapshotRegistry>,
        array: Arc<dyn ArrayClient>,
        catalog: Arc<dyn CatalogService>,
        parallelism: usize,
    ) -> Self {
        Self {
            registry,
            array,
            catalog,
            parallelism: parallelism.max(1),
        }
    }

    fn check_pair(&self, source: CopyId, destination: CopyId) -> SnapResult<()> {
        let from = self.registry.copy(source)?;
        let to = self.registry.copy(destination)?;
        if source == destination {
            return Err(SnapError::Config(format!("aux copy from {source} onto itself")));
        }
        if from.policy != to.policy {
            return Err(SnapError::Config(format!(
                "copies {source} and {destination} belong to different storage policies"
            )));
        }
        if !matches!(to.kind, CopyKind::Vault | CopyKind::Aux) {
            return Err(SnapError::Config(format!(
                "aux copy destination {} is a {} copy",
                to.name, to.kind
            )));
        }
        Ok(())
    }

    async fn copy_one(
        &self,
        ctx: &OperationContext,
        source: SnapshotId,
        destination: CopyId,
    ) -> Result<CopiedSnapshot, SnapshotFailure> {
        derive_snapshot(
            &self.registry,
            &*self.array,
            &*self.catalog,
            ctx,
            source,
            destination,
            Operation::Replicate,
        )
        .await
        .map(|derived| CopiedSnapshot {
            source,
            derived: derived.id,
        })
        .map_err(|e| SnapshotFailure::new(source, &e))
    }
}

#[async_trait]
impl AuxCopyEngine for ArrayAuxCopyEngine {
    async fn aux_copy(
        &self,
        ctx: &OperationContext,
        source: CopyId,
        destination: CopyId,
        scale_out: bool,
    ) -> SnapResult<CopyReport> {
        self.check_pair(source, destination)?;
        let (pending, skipped) = pending_sources(&self.registry, source, destination);
        let mut report = CopyReport::new(source, destination);
        report.skipped = skipped;
        tracing::info!(
            source = %source,
            destination = %destination,
            pending = pending.len(),
            skipped,
            scale_out,
            correlation = %ctx.correlation,
            "Aux copy started"
        );

        let width = if scale_out { self.parallelism } else { 1 };
        let jobs: Vec<_> = pending
            .iter()
            .map(|s| self.copy_one(ctx, s.id, destination))
            .collect();
        let results: Vec<_> = stream::iter(jobs)
            .buffer_unordered(width)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(copied) => report.copied.push(copied),
                Err(failure) => report.failed.push(failure),
            }
        }
        report.copied.sort_by_key(|c| c.source);
        report.failed.sort_by_key(|f| f.snapshot);

        if report.is_clean() {
            tracing::info!(
                source = %source,
                destination = %destination,
                copied = report.copied.len(),
                "Aux copy finished"
            );
        } else {
            tracing::warn!(
                source = %source,
                destination = %destination,
                copied = report.copied.len(),
                failed = ?report.failed_ids(),
                "Aux copy finished with failures"
            );
        }
        Ok(report)
    }
}
