//! Shared plumbing for producing a derived snapshot on another copy.

use crate::catalog::catalog_snapshots;
use crate::context::OperationContext;
use isnap_kernel::api::{ArrayClient, CatalogService};
use isnap_kernel::error::{SnapError, SnapResult, SnapshotFailure};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::scheduler::run_array_job;
use isnap_kernel::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedSnapshot {
    pub source: SnapshotId,
    pub derived: SnapshotId,
}

/// Result of one aux copy or backup copy run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyReport {
    pub source_copy: CopyId,
    pub destination_copy: CopyId,
    pub copied: Vec<CopiedSnapshot>,
    pub failed: Vec<SnapshotFailure>,
    /// Source snapshots that already had a live counterpart
    pub skipped: usize,
}

impl CopyReport {
    pub fn new(source_copy: CopyId, destination_copy: CopyId) -> Self {
        Self {
            source_copy,
            destination_copy,
            copied: Vec::new(),
            failed: Vec::new(),
            skipped: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Ids worth resubmitting
    pub fn failed_ids(&self) -> Vec<SnapshotId> {
        self.failed.iter().map(|f| f.snapshot).collect()
    }
}

/// Restorable snapshots on `source` without a live counterpart (same
/// backup job) on `destination`, plus how many were skipped for having one.
pub(crate) fn pending_sources(
    registry: &SnapshotRegistry,
    source: CopyId,
    destination: CopyId,
) -> (Vec<Snapshot>, usize) {
    let present: Vec<JobId> = registry
        .list_by_copy(destination)
        .into_iter()
        .filter(|s| !s.state.is_retired())
        .map(|s| s.job)
        .collect();
    let (done, pending): (Vec<Snapshot>, Vec<Snapshot>) = registry
        .list_by_copy(source)
        .into_iter()
        .filter(|s| s.state.is_restorable())
        .partition(|s| present.contains(&s.job));
    (pending, done.len())
}

/// Replicates or materializes `source` onto `destination` under the source's
/// lease, registers and catalogs the result, and keeps the dependency edge
/// IN_PROGRESS until the derived snapshot is CATALOGED.
pub(crate) async fn derive_snapshot(
    registry: &SnapshotRegistry,
    array: &dyn ArrayClient,
    catalog: &dyn CatalogService,
    ctx: &OperationContext,
    source: SnapshotId,
    destination: CopyId,
    operation: Operation,
) -> SnapResult<Snapshot> {
    ctx.check_cancelled()?;
    let _lease = registry.try_lease(source, operation)?;
    let snap = registry.get(source)?;
    if !snap.state.is_restorable() {
        return Err(SnapError::ValidationFailure {
            operation,
            snapshot: source,
            reason: format!("source is {}", snap.state),
        });
    }
    let handle = snap.handle.as_ref().ok_or_else(|| SnapError::ValidationFailure {
        operation,
        snapshot: source,
        reason: "source has no array handle".to_string(),
    })?;

    registry.open_edge(source, destination)?;
    let mut derived: Option<SnapshotId> = None;
    let outcome = async {
        let submitted = run_array_job(&ctx.retry, operation, Some(source), ctx.timeout, move || async move {
            match operation {
                Operation::Materialize => array.materialize_backup_copy(handle, destination).await,
                _ => array.replicate_snapshot(handle, destination).await,
            }
        })
        .await?;
        let entry = registry.register(snap.job, destination, Some(submitted.handle), Some(source))?;
        derived = Some(entry.id);
        registry.update_edge(source, destination, Some(entry.id), EdgeState::InProgress)?;
        let mut cataloged = catalog_snapshots(registry, catalog, ctx, destination, &[entry.id]).await?;
        cataloged.pop().ok_or_else(|| SnapError::snapshot_not_found(entry.id))
    }
    .await;

    match outcome {
        Ok(entry) => {
            registry.update_edge(source, destination, Some(entry.id), EdgeState::Materialized)?;
            tracing::info!(
                source = %source,
                derived = %entry.id,
                copy = %destination,
                %operation,
                correlation = %ctx.correlation,
                "Derived snapshot cataloged"
            );
            Ok(entry)
        }
        Err(err) => {
            if let Some(id) = derived {
                if let Err(e) = registry.transition(id, SnapshotEvent::Invalidate, ctx.correlation()) {
                    tracing::warn!(snapshot = %id, error = %e, "Could not invalidate uncataloged derived snapshot");
                }
            }
            if let Err(e) = registry.update_edge(source, destination, derived, EdgeState::Failed) {
                tracing::warn!(source = %source, error = %e, "Could not close dependency edge");
            }
            tracing::warn!(
                source = %source,
                copy = %destination,
                %operation,
                error = %err,
                correlation = %ctx.correlation,
                "Derived copy failed"
            );
            Err(err)
        }
    }
}
