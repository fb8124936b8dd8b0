use crate::context::OperationContext;
use isnap_kernel::api::CatalogService;
use isnap_kernel::error::SnapResult;
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::scheduler::run_array_job;
use isnap_kernel::types::{CopyId, Operation, Snapshot, SnapshotEvent, SnapshotId, SnapshotState};

/// Runs one catalog job over `ids` and moves each from CREATED to CATALOGED.
pub(crate) async fn catalog_snapshots(
    registry: &SnapshotRegistry,
    catalog: &dyn CatalogService,
    ctx: &OperationContext,
    copy: CopyId,
    ids: &[SnapshotId],
) -> SnapResult<Vec<Snapshot>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let single = (ids.len() == 1).then(|| ids[0]);
    run_array_job(&ctx.retry, Operation::Catalog, single, ctx.timeout, move || {
        catalog.catalog(copy, ids)
    })
    .await?;
    let mut cataloged = Vec::with_capacity(ids.len());
    for id in ids {
        cataloged.push(registry.compare_and_transition(
            *id,
            SnapshotState::Created,
            SnapshotEvent::Catalog,
            ctx.correlation(),
        )?);
    }
    tracing::info!(copy = %copy, count = cataloged.len(), correlation = %ctx.correlation, "Snapshots cataloged");
    Ok(cataloged)
}
