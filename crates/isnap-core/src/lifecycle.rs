//! The lifecycle facade
//!
//! Wires the registry, the collaborators and one implementation of each
//! component together, and adds the flows that span components: taking a
//! snapshot during a backup, deferred cataloging and reconcile.

use crate::aging::{AgingReport, AgingScope, DataAgingScheduler, RetentionAgingScheduler};
use crate::aux_copy::{ArrayAuxCopyEngine, AuxCopyEngine};
use crate::backup_copy::{ArrayBackupCopyEngine, BackupCopyEngine};
use crate::catalog::catalog_snapshots;
use crate::config::LifecycleConfig;
use crate::context::OperationContext;
use crate::copy::CopyReport;
use crate::delete::{ArrayDeleteController, DeleteController};
use crate::mount::{ArrayMountController, MountController};
use crate::resolver::{CopyPrecedenceResolver, RegistryResolver};
use crate::revert::{ArrayRevertController, RevertController};
use chrono::{DateTime, Utc};
use isnap_kernel::api::{ArrayClient, CatalogService};
use isnap_kernel::error::{SnapError, SnapResult, SnapshotFailure};
use isnap_kernel::registry::{RevertOutcome, SnapshotRegistry};
use isnap_kernel::scheduler::{run_array_job, submit_with_retry};
use isnap_kernel::store::JsonFileStore;
use isnap_kernel::types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A snapshot-backed backup request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub copy: CopyId,
    pub volume: String,
    pub subclient: String,
    pub level: BackupLevel,
    /// Leave the snapshot CREATED; `catalog_pending` picks it up later
    pub defer_catalog: bool,
}

impl BackupRequest {
    #[inline]
    #[must_use]
    pub fn new(copy: CopyId, volume: impl Into<String>) -> Self {
        Self {
            copy,
            volume: volume.into(),
            subclient: "default".to_string(),
            level: BackupLevel::Full,
            defer_catalog: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_level(mut self, level: BackupLevel) -> Self {
        self.level = level;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_subclient(mut self, subclient: impl Into<String>) -> Self {
        self.subclient = subclient.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.defer_catalog = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Gone from the array and now DELETED in the registry
    pub retired: Vec<SnapshotId>,
    /// Leased by another operation; not looked at
    pub busy: Vec<SnapshotId>,
    /// Existence could not be read; left as they were
    #[serde(default)]
    pub failed: Vec<SnapshotFailure>,
}

pub struct SnapLifecycle {
    config: LifecycleConfig,
    registry: Arc<SnapshotRegistry>,
    array: Arc<dyn ArrayClient>,
    catalog: Arc<dyn CatalogService>,
    resolver: Arc<dyn CopyPrecedenceResolver>,
    mounts: Arc<dyn MountController>,
    reverts: Arc<dyn RevertController>,
    deletes: Arc<dyn DeleteController>,
    aux: Arc<dyn AuxCopyEngine>,
    backup_copy: Arc<dyn BackupCopyEngine>,
    aging: Arc<RetentionAgingScheduler>,
}

impl std::fmt::Debug for SnapLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapLifecycle")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SnapLifecycle {
    /// Builds the lifecycle over an existing registry and upserts the
    /// configured storage policies into it.
    pub fn new(
        config: LifecycleConfig,
        registry: Arc<SnapshotRegistry>,
        array: Arc<dyn ArrayClient>,
        catalog: Arc<dyn CatalogService>,
    ) -> SnapResult<Self> {
        config.validate()?;
        for policy in config.storage_policies()? {
            registry.define_policy(policy)?;
        }
        let mounts: Arc<dyn MountController> = Arc::new(ArrayMountController::new(
            Arc::clone(&registry),
            Arc::clone(&array),
            config.mount_verify,
            config.default_mount_path.clone(),
        ));
        let deletes: Arc<dyn DeleteController> = Arc::new(ArrayDeleteController::new(
            Arc::clone(&registry),
            Arc::clone(&array),
            Arc::clone(&mounts),
            config.delete_verify,
        ));
        Ok(Self {
            resolver: Arc::new(RegistryResolver::new(Arc::clone(&registry))),
            reverts: Arc::new(ArrayRevertController::new(Arc::clone(&registry), Arc::clone(&array))),
            aux: Arc::new(ArrayAuxCopyEngine::new(
                Arc::clone(&registry),
                Arc::clone(&array),
                Arc::clone(&catalog),
                config.aux_parallelism,
            )),
            backup_copy: Arc::new(ArrayBackupCopyEngine::new(
                Arc::clone(&registry),
                Arc::clone(&array),
                Arc::clone(&catalog),
            )),
            aging: Arc::new(
                RetentionAgingScheduler::new(Arc::clone(&registry), Arc::clone(&deletes))
                    .with_compaction(config.retired_retention()),
            ),
            mounts,
            deletes,
            config,
            registry,
            array,
            catalog,
        })
    }

    /// Opens the durable registry named by the configuration.
    pub fn open(
        config: LifecycleConfig,
        array: Arc<dyn ArrayClient>,
        catalog: Arc<dyn CatalogService>,
    ) -> SnapResult<Self> {
        let store = JsonFileStore::open(&config.registry_path)?;
        let registry = Arc::new(SnapshotRegistry::open(Box::new(store))?);
        Self::new(config, registry, array, catalog)
    }

    pub fn registry(&self) -> &Arc<SnapshotRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Context carrying the configured timeout and retry policy.
    pub fn context(&self) -> OperationContext {
        self.config.context()
    }

    // ---------------------------------------------------------------------
    // Backup and cataloging
    // ---------------------------------------------------------------------

    /// Takes an array snapshot as part of a new backup job and registers it
    /// on `request.copy`; catalogs it inline unless deferred.
    pub async fn snap_backup(&self, ctx: &OperationContext, request: &BackupRequest) -> SnapResult<Snapshot> {
        ctx.check_cancelled()?;
        self.registry.copy(request.copy)?;
        let job = self.registry.record_job(
            request.level,
            &request.subclient,
            &request.volume,
            Utc::now(),
        )?;
        tracing::info!(
            job = %job.id,
            copy = %request.copy,
            volume = %request.volume,
            correlation = %ctx.correlation,
            "Backup job started"
        );

        let array = &*self.array;
        let volume = request.volume.as_str();
        let created = match run_array_job(&ctx.retry, Operation::Create, None, ctx.timeout, move || {
            array.create_snapshot(volume)
        })
        .await
        {
            Ok(created) => created,
            Err(err) => {
                self.registry.finish_job(job.id, JobStatus::Failed)?;
                tracing::error!(job = %job.id, error = %err, "Snapshot creation failed");
                return Err(err);
            }
        };
        let snap = self
            .registry
            .register(job.id, request.copy, Some(created.handle), None)?;
        self.registry.finish_job(job.id, JobStatus::Completed)?;

        if request.defer_catalog {
            tracing::info!(snapshot = %snap.id, job = %job.id, "Snapshot created, cataloging deferred");
            return Ok(snap);
        }
        let mut cataloged =
            catalog_snapshots(&self.registry, &*self.catalog, ctx, request.copy, &[snap.id]).await?;
        cataloged.pop().ok_or_else(|| SnapError::snapshot_not_found(snap.id))
    }

    /// Catalogs every CREATED snapshot on `copy` in one catalog job.
    pub async fn catalog_pending(&self, ctx: &OperationContext, copy: CopyId) -> SnapResult<Vec<Snapshot>> {
        self.registry.copy(copy)?;
        let pending: Vec<SnapshotId> = self
            .registry
            .list_by_copy(copy)
            .into_iter()
            .filter(|s| s.state == SnapshotState::Created)
            .map(|s| s.id)
            .collect();
        catalog_snapshots(&self.registry, &*self.catalog, ctx, copy, &pending).await
    }

    // ---------------------------------------------------------------------
    // Component operations
    // ---------------------------------------------------------------------

    pub async fn mount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
        access: AccessMode,
    ) -> SnapResult<MountPoint> {
        self.mounts.mount(ctx, snapshot, destination, access).await
    }

    pub async fn unmount(
        &self,
        ctx: &OperationContext,
        snapshot: SnapshotId,
        destination: &Destination,
    ) -> SnapResult<Option<Snapshot>> {
        self.mounts.unmount(ctx, snapshot, destination).await
    }

    pub async fn force_unmount(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<usize> {
        self.mounts.force_unmount(ctx, snapshot).await
    }

    pub fn mount_status(&self, snapshot: SnapshotId) -> SnapResult<Vec<MountPoint>> {
        self.mounts.mount_status(snapshot)
    }

    pub async fn revert(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<RevertOutcome> {
        self.reverts.revert(ctx, snapshot).await
    }

    pub async fn delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot> {
        self.deletes.delete(ctx, snapshot).await
    }

    pub async fn force_delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot> {
        self.deletes.force_delete(ctx, snapshot).await
    }

    pub async fn aux_copy(
        &self,
        ctx: &OperationContext,
        source: CopyId,
        destination: CopyId,
        scale_out: bool,
    ) -> SnapResult<CopyReport> {
        self.aux.aux_copy(ctx, source, destination, scale_out).await
    }

    pub async fn backup_copy(
        &self,
        ctx: &OperationContext,
        policy: StoragePolicyId,
        source: Option<CopyId>,
    ) -> SnapResult<CopyReport> {
        self.backup_copy.backup_copy(ctx, policy, source).await
    }

    pub async fn run_aging(&self, ctx: &OperationContext, scope: AgingScope) -> SnapResult<AgingReport> {
        self.aging.run_aging(ctx, scope).await
    }

    /// Background aging every `aging_interval_secs`; cancel the token to stop.
    pub fn spawn_aging(&self, scope: AgingScope) -> CancellationToken {
        Arc::clone(&self.aging).spawn_periodic(self.context(), scope, self.config.aging_interval())
    }

    pub fn resolve(
        &self,
        policy: StoragePolicyId,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<Vec<CopyId>> {
        self.resolver.resolve(policy, as_of)
    }

    pub fn resolve_for_restore(
        &self,
        policy: StoragePolicyId,
        preferred: Option<CopyId>,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<CopyId> {
        self.resolver.resolve_for_restore(policy, preferred, as_of)
    }

    // ---------------------------------------------------------------------
    // Reconcile and audit
    // ---------------------------------------------------------------------

    /// Drives every registry entry on `copy` whose array snapshot is gone to
    /// DELETED. Completes deletes whose verification ran out of polls.
    pub async fn reconcile(&self, ctx: &OperationContext, copy: CopyId) -> SnapResult<ReconcileReport> {
        self.registry.copy(copy)?;
        let mut report = ReconcileReport::default();
        for snap in self.registry.list_by_copy(copy) {
            ctx.check_cancelled()?;
            if snap.state.is_terminal() {
                continue;
            }
            let Some(handle) = snap.handle.as_ref() else {
                continue;
            };
            let Ok(_lease) = self.registry.try_lease(snap.id, Operation::Reconcile) else {
                report.busy.push(snap.id);
                continue;
            };
            report.checked += 1;
            let array = &*self.array;
            let exists = submit_with_retry(&ctx.retry, Operation::Reconcile, Some(snap.id), move || {
                array.snapshot_exists(handle)
            })
            .await;
            let exists = match exists {
                Ok(exists) => exists,
                Err(err) => {
                    tracing::warn!(
                        snapshot = %snap.id,
                        kind = err.kind().as_str(),
                        error = %err,
                        "Could not read snapshot existence, skipping"
                    );
                    report.failed.push(SnapshotFailure::new(snap.id, &err));
                    continue;
                }
            };
            if !exists {
                let retired = self.registry.retire_missing(snap.id, ctx.correlation())?;
                tracing::warn!(
                    snapshot = %snap.id,
                    from = %snap.state,
                    to = %retired.state,
                    "Snapshot missing on array, retired"
                );
                report.retired.push(snap.id);
            }
        }
        tracing::info!(
            copy = %copy,
            checked = report.checked,
            retired = report.retired.len(),
            busy = report.busy.len(),
            failed = report.failed.len(),
            correlation = %ctx.correlation,
            "Reconcile finished"
        );
        Ok(report)
    }

    /// Verifies the audit trail hash chain; returns the record count.
    pub fn verify_audit(&self) -> SnapResult<usize> {
        self.registry.verify_audit()
    }
}
