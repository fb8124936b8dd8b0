//! End-to-end lifecycle flows against the simulated array

use chrono::Duration as ChronoDuration;
use isnap_core::config::CopyConfig;
use isnap_core::prelude::*;
use isnap_core::PolicyConfig;
use isnap_core::VerifyPolicy;
use isnap_test_utils::{Fixture, AUX, BACKUP_COPY, GOLD, PRIMARY, VAULT};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn fast_config() -> LifecycleConfig {
    LifecycleConfig::new()
        .with_retry(RetryPolicy::immediate(3))
        .with_timeout(Duration::from_secs(5))
        .with_mount_verify(VerifyPolicy::new(3, Duration::from_millis(1)))
        .with_delete_verify(VerifyPolicy::new(3, Duration::from_millis(1)))
        .with_aux_parallelism(4)
}

fn lifecycle(fx: &Fixture) -> Arc<SnapLifecycle> {
    Arc::new(
        SnapLifecycle::new(
            fast_config(),
            Arc::clone(&fx.registry),
            fx.array_client(),
            fx.catalog_service(),
        )
        .unwrap(),
    )
}

async fn until(mut reached: impl FnMut() -> bool) {
    for _ in 0..400 {
        if reached() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn host(name: &str) -> Destination {
    Destination::new(name)
}

// ---------------------------------------------------------------------------
// Backup, mount, unmount
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backup_mount_unmount_cycle() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();

    let s1 = lc
        .snap_backup(&ctx, &BackupRequest::new(PRIMARY, "/vol/a"))
        .await
        .unwrap();
    assert_eq!(s1.state, SnapshotState::Cataloged);
    assert_eq!(fx.catalog.cataloged(), vec![s1.id]);
    assert_eq!(fx.registry.job(s1.job).unwrap().status, JobStatus::Completed);

    let mount = lc
        .mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    assert_eq!(mount.lease, LeaseState::Active);
    assert_eq!(mount.mount_path, format!("/mnt/isnap/{}", s1.id));
    assert_eq!(fx.state_of(s1.id), SnapshotState::Mounted);
    let handle = s1.handle.clone().unwrap();
    assert!(fx.array.mounted_on(&handle, &host("hostA")));
    assert!(fx.registry.get(s1.id).unwrap().last_validated_at.is_some());

    let unmounted = lc.unmount(&ctx, s1.id, &host("hostA")).await.unwrap();
    assert_eq!(unmounted.map(|s| s.state), Some(SnapshotState::Unmounted));
    assert!(lc.mount_status(s1.id).unwrap().is_empty());
    assert!(!fx.array.mounted_on(&handle, &host("hostA")));

    // Remount from UNMOUNTED.
    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadWrite)
        .await
        .unwrap();
    assert_eq!(fx.state_of(s1.id), SnapshotState::Mounted);
}

#[tokio::test]
async fn unmount_without_mount_is_a_noop() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;

    let out = lc.unmount(&lc.context(), s1.id, &host("hostA")).await.unwrap();
    assert!(out.is_none());
    assert_eq!(fx.state_of(s1.id), SnapshotState::Cataloged);
    assert_eq!(fx.array.calls(Operation::Unmount), 0);
}

#[tokio::test]
async fn second_mount_to_same_destination_conflicts() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;

    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    let err = lc
        .mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MountConflict);
    assert!(!err.is_retryable());
    assert_eq!(lc.mount_status(s1.id).unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_mounts_to_one_destination_admit_one() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    let gate = fx.array.gate(Operation::Mount);

    let first = {
        let lc = Arc::clone(&lc);
        let id = s1.id;
        tokio::spawn(async move {
            let ctx = lc.context();
            lc.mount(&ctx, id, &host("hostA"), AccessMode::ReadOnly).await
        })
    };
    until(|| fx.registry.mount_point(s1.id, &host("hostA")).is_some()).await;
    assert_eq!(
        fx.registry.mount_point(s1.id, &host("hostA")).unwrap().lease,
        LeaseState::Pending
    );

    let err = lc
        .mount(&lc.context(), s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MountConflict);

    gate.open();
    let mount = first.await.unwrap().unwrap();
    assert_eq!(mount.lease, LeaseState::Active);
    assert_eq!(fx.registry.mounts(s1.id).len(), 1);
}

#[tokio::test]
async fn failed_mount_verification_releases_the_claim() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.array.hide_mounts(true);

    let err = lc
        .mount(&lc.context(), s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Cataloged);
    assert!(fx.registry.mounts(s1.id).is_empty());
    assert!(fx.registry.locks().busy(s1.id).is_none());
}

#[tokio::test]
async fn transient_mount_failures_are_retried() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;

    fx.array.fail_next(Operation::Mount, 2);
    lc.mount(&lc.context(), s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    assert_eq!(fx.array.calls(Operation::Mount), 3);

    let s2 = fx.primary_snapshot("/vol/b").await;
    fx.array.fail_next(Operation::Mount, 3);
    let err = lc
        .mount(&lc.context(), s2.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArrayCommunication);
    assert_eq!(err.snapshot(), Some(s2.id));
    assert_eq!(fx.state_of(s2.id), SnapshotState::Cataloged);
    assert!(fx.registry.mounts(s2.id).is_empty());
}

#[tokio::test]
async fn mount_timeout_leaves_snapshot_untouched() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.array.stall(Operation::Mount);

    let ctx = lc.context().with_timeout(Duration::from_millis(50));
    let err = lc
        .mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Cataloged);
    assert!(fx.registry.mounts(s1.id).is_empty());
    // Not retried.
    assert_eq!(fx.array.calls(Operation::Mount), 1);
}

// ---------------------------------------------------------------------------
// Aux copy, backup copy, resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aux_copy_then_delete_source_restores_from_vault() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;

    let report = lc.aux_copy(&ctx, PRIMARY, VAULT, false).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.copied.len(), 1);
    let s2 = fx.registry.get(report.copied[0].derived).unwrap();
    assert_eq!(s2.copy, VAULT);
    assert_eq!(s2.source, Some(s1.id));
    assert_eq!(s2.job, s1.job);
    assert_eq!(s2.state, SnapshotState::Cataloged);

    let edges = fx.registry.edges_from(s1.id);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].derived_snapshot, Some(s2.id));
    assert_eq!(edges[0].state, EdgeState::Materialized);

    assert_eq!(lc.resolve_for_restore(GOLD, None, None).unwrap(), PRIMARY);
    let deleted = lc.delete(&ctx, s1.id).await.unwrap();
    assert_eq!(deleted.state, SnapshotState::Deleted);
    assert_eq!(lc.resolve_for_restore(GOLD, None, None).unwrap(), VAULT);
    assert_eq!(lc.resolve(GOLD, None).unwrap(), vec![VAULT]);
}

#[tokio::test]
async fn backup_copy_blocks_source_delete_until_materialized() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    fx.primary_snapshot("/vol/a").await;
    let aux = lc.aux_copy(&ctx, PRIMARY, VAULT, false).await.unwrap();
    let s2 = aux.copied[0].derived;

    let gate = fx.array.gate(Operation::Materialize);
    let running = {
        let lc = Arc::clone(&lc);
        tokio::spawn(async move {
            let ctx = lc.context();
            lc.backup_copy(&ctx, GOLD, Some(VAULT)).await
        })
    };
    until(|| fx.registry.blocking_edge(s2).is_some()).await;

    let err = lc.delete(&ctx, s2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyBlocked);
    assert_eq!(fx.state_of(s2), SnapshotState::Cataloged);

    gate.open();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.source_copy, VAULT);
    assert_eq!(report.destination_copy, BACKUP_COPY);
    let s3 = fx.registry.get(report.copied[0].derived).unwrap();
    assert_eq!(s3.copy, BACKUP_COPY);
    assert_eq!(s3.state, SnapshotState::Cataloged);
    assert_eq!(s3.source, Some(s2));

    assert_eq!(lc.delete(&ctx, s2).await.unwrap().state, SnapshotState::Deleted);
}

#[tokio::test]
async fn backup_copy_uses_policy_source_then_primary() {
    let mut policy = isnap_test_utils::gold_policy();
    policy.backup_copy_source = Some(VAULT);
    let fx = Fixture::with_policy(policy);
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    fx.primary_snapshot("/vol/a").await;

    // Vault is empty, so nothing is materialized.
    let report = lc.backup_copy(&ctx, GOLD, None).await.unwrap();
    assert_eq!(report.source_copy, VAULT);
    assert!(report.copied.is_empty());

    let report = lc.backup_copy(&ctx, GOLD, Some(PRIMARY)).await.unwrap();
    assert_eq!(report.source_copy, PRIMARY);
    assert_eq!(report.copied.len(), 1);
}

#[tokio::test]
async fn incomplete_backup_copy_job_is_a_hard_failure() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.array
        .job_outcome(Operation::Materialize, JobStatus::CompletedWithErrors, "media full");

    let err = lc.backup_copy(&lc.context(), GOLD, None).await.unwrap_err();
    match &err {
        SnapError::BackupCopyFailed {
            policy,
            status,
            reason,
            ..
        } => {
            assert_eq!(*policy, GOLD);
            assert_eq!(*status, JobStatus::CompletedWithErrors);
            assert_eq!(reason, "media full");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("Completed w/ one or more errors"));
    assert_eq!(fx.array.calls(Operation::Materialize), 1);
    assert_eq!(fx.registry.edges_from(s1.id)[0].state, EdgeState::Failed);
    assert!(fx
        .registry
        .list_by_copy(BACKUP_COPY)
        .iter()
        .all(|s| s.state.is_retired()));
    // The failed edge does not block the source.
    lc.delete(&lc.context(), s1.id).await.unwrap();
}

#[tokio::test]
async fn aux_copy_reports_per_snapshot_failures() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    let s2 = fx.primary_snapshot("/vol/b").await;
    fx.array.remove_out_of_band(s1.handle.as_ref().unwrap());

    let report = lc.aux_copy(&lc.context(), PRIMARY, AUX, true).await.unwrap();
    assert_eq!(report.copied.len(), 1);
    assert_eq!(report.copied[0].source, s2.id);
    assert_eq!(report.failed_ids(), vec![s1.id]);
    assert_eq!(report.failed[0].kind, ErrorKind::JobFailed);

    // Rerun: the copied entry is skipped, the failed one is retried.
    let again = lc.aux_copy(&lc.context(), PRIMARY, AUX, false).await.unwrap();
    assert_eq!(again.skipped, 1);
    assert_eq!(again.failed_ids(), vec![s1.id]);
}

#[tokio::test]
async fn aux_copy_rejects_invalid_destination() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let err = lc.aux_copy(&ctx, PRIMARY, BACKUP_COPY, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    let err = lc.aux_copy(&ctx, VAULT, VAULT, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn uncataloged_replica_is_invalidated() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.catalog.job_outcome(JobStatus::Failed, "index unavailable");

    let report = lc.aux_copy(&lc.context(), PRIMARY, VAULT, false).await.unwrap();
    assert_eq!(report.failed_ids(), vec![s1.id]);
    let edge = &fx.registry.edges_from(s1.id)[0];
    assert_eq!(edge.state, EdgeState::Failed);
    let replica = edge.derived_snapshot.unwrap();
    assert_eq!(fx.state_of(replica), SnapshotState::Stale);
}

// ---------------------------------------------------------------------------
// Revert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revert_requires_unmount_and_invalidates_later_snapshots() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::hours(2))
        .await;
    let s1b = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Incremental, ChronoDuration::hours(1))
        .await;
    let other = fx.primary_snapshot("/vol/other").await;

    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    let err = lc.revert(&ctx, s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    lc.unmount(&ctx, s1.id, &host("hostA")).await.unwrap();
    let outcome = lc.revert(&ctx, s1.id).await.unwrap();
    assert_eq!(outcome.reverted.state, SnapshotState::Reverted);
    assert_eq!(outcome.invalidated, vec![s1b.id]);
    assert_eq!(fx.state_of(s1b.id), SnapshotState::Stale);
    assert_eq!(fx.state_of(other.id), SnapshotState::Cataloged);

    let err = lc
        .mount(&ctx, s1b.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    // STALE snapshots can still be deleted.
    lc.delete(&ctx, s1b.id).await.unwrap();
}

#[tokio::test]
async fn revert_holds_the_volume_chain() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::hours(2))
        .await;
    let s1b = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::hours(1))
        .await;
    let gate = fx.array.gate(Operation::Revert);

    let reverting = {
        let lc = Arc::clone(&lc);
        let id = s1.id;
        tokio::spawn(async move {
            let ctx = lc.context();
            lc.revert(&ctx, id).await
        })
    };
    let chain = s1.volume_key();
    until(|| fx.registry.locks().reverting(&chain).is_some()).await;

    let ctx = lc.context();
    let err = lc
        .mount(&ctx, s1b.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevertInProgress);
    assert!(fx.registry.mounts(s1b.id).is_empty());
    let err = lc.delete(&ctx, s1b.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevertInProgress);

    gate.open();
    reverting.await.unwrap().unwrap();
    assert_eq!(fx.state_of(s1b.id), SnapshotState::Stale);
    assert!(fx.registry.locks().reverting(&chain).is_none());
}

#[tokio::test]
async fn revert_is_blocked_by_in_flight_copy() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.registry.open_edge(s1.id, VAULT).unwrap();

    let err = lc.revert(&lc.context(), s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyBlocked);
    assert_eq!(fx.array.calls(Operation::Revert), 0);
}

#[tokio::test]
async fn revert_refused_for_mounted_later_snapshot_leaves_array_untouched() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::hours(2))
        .await;
    let s2 = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::hours(1))
        .await;
    lc.mount(&ctx, s2.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();

    let err = lc.revert(&ctx, s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(err.snapshot(), Some(s2.id));
    assert_eq!(fx.array.calls(Operation::Revert), 0);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Cataloged);
    assert_eq!(fx.state_of(s2.id), SnapshotState::Mounted);
    assert!(fx.registry.locks().reverting(&s1.volume_key()).is_none());

    lc.unmount(&ctx, s2.id, &host("hostA")).await.unwrap();
    let outcome = lc.revert(&ctx, s1.id).await.unwrap();
    assert_eq!(outcome.invalidated, vec![s2.id]);
    assert_eq!(fx.array.calls(Operation::Revert), 1);
}

// ---------------------------------------------------------------------------
// Delete and reconcile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_that_cannot_be_verified_is_a_validation_failure() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;
    // Three verification polls, all still seeing the snapshot.
    fx.array.linger_after_delete(3);

    let err = lc.delete(&ctx, s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Deleting);

    let report = lc.reconcile(&ctx, PRIMARY).await.unwrap();
    assert_eq!(report.retired, vec![s1.id]);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Deleted);
}

#[tokio::test]
async fn delete_of_mounted_snapshot_needs_force() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;
    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();

    let err = lc.delete(&ctx, s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(fx.array.calls(Operation::Delete), 0);

    let deleted = lc.force_delete(&ctx, s1.id).await.unwrap();
    assert_eq!(deleted.state, SnapshotState::Deleted);
    assert!(fx.registry.mounts(s1.id).is_empty());
    assert!(!fx.array.exists(s1.handle.as_ref().unwrap()));
}

#[tokio::test]
async fn deleting_twice_is_a_soft_success() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;

    lc.delete(&ctx, s1.id).await.unwrap();
    let again = lc.delete(&ctx, s1.id).await.unwrap();
    assert_eq!(again.state, SnapshotState::Deleted);
    assert_eq!(fx.array.calls(Operation::Delete), 1);
}

#[tokio::test]
async fn delete_timeout_rolls_back_to_prior_state() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    lc.mount(&lc.context(), s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    lc.unmount(&lc.context(), s1.id, &host("hostA")).await.unwrap();
    fx.array.stall(Operation::Delete);

    let ctx = lc.context().with_timeout(Duration::from_millis(50));
    let err = lc.delete(&ctx, s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Unmounted);
    assert!(fx.array.exists(s1.handle.as_ref().unwrap()));

    fx.array.clear(Operation::Delete);
    let deleted = lc.delete(&lc.context(), s1.id).await.unwrap();
    assert_eq!(deleted.state, SnapshotState::Deleted);
}

#[tokio::test]
async fn rejected_delete_rolls_back() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let s1 = fx.primary_snapshot("/vol/a").await;
    fx.array
        .job_outcome(Operation::Delete, JobStatus::Failed, "snapshot is busy");

    let err = lc.delete(&lc.context(), s1.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobFailed);
    assert!(err.to_string().contains("snapshot is busy"));
    let snap = fx.registry.get(s1.id).unwrap();
    assert_eq!(snap.state, SnapshotState::Cataloged);
    assert_eq!(snap.prior_state, None);
}

#[tokio::test]
async fn reconcile_retires_snapshots_removed_out_of_band() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;
    let s2 = fx.primary_snapshot("/vol/b").await;
    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    fx.array.remove_out_of_band(s1.handle.as_ref().unwrap());

    let report = lc.reconcile(&ctx, PRIMARY).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.retired, vec![s1.id]);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Deleted);
    assert_eq!(fx.state_of(s2.id), SnapshotState::Cataloged);
    assert!(fx.registry.mounts(s1.id).is_empty());
}

#[tokio::test]
async fn reconcile_records_unreadable_snapshot_and_carries_on() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;
    let s2 = fx.primary_snapshot("/vol/b").await;
    fx.array.remove_out_of_band(s1.handle.as_ref().unwrap());
    fx.array.remove_out_of_band(s2.handle.as_ref().unwrap());
    // Exactly the retry budget, so only the first existence read gives up.
    fx.array.fail_next(Operation::Reconcile, 3);

    let report = lc.reconcile(&ctx, PRIMARY).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].snapshot, s1.id);
    assert_eq!(report.failed[0].kind, ErrorKind::ArrayCommunication);
    assert_eq!(report.retired, vec![s2.id]);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Cataloged);

    let report = lc.reconcile(&ctx, PRIMARY).await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.retired, vec![s1.id]);
    assert_eq!(fx.state_of(s1.id), SnapshotState::Deleted);
}

// ---------------------------------------------------------------------------
// Cataloging, aging, persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deferred_cataloging_runs_one_job_for_the_copy() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();

    let a = lc
        .snap_backup(&ctx, &BackupRequest::new(PRIMARY, "/vol/a").deferred())
        .await
        .unwrap();
    let b = lc
        .snap_backup(
            &ctx,
            &BackupRequest::new(PRIMARY, "/vol/b")
                .with_level(BackupLevel::Incremental)
                .deferred(),
        )
        .await
        .unwrap();
    assert_eq!(a.state, SnapshotState::Created);
    assert_eq!(
        lc.resolve(GOLD, None).unwrap_err().kind(),
        ErrorKind::NoEligibleCopy
    );

    let cataloged = lc.catalog_pending(&ctx, PRIMARY).await.unwrap();
    assert_eq!(cataloged.len(), 2);
    assert_eq!(fx.catalog.calls(), 1);
    assert_eq!(fx.state_of(b.id), SnapshotState::Cataloged);
    assert_eq!(lc.resolve(GOLD, None).unwrap(), vec![PRIMARY]);
}

#[tokio::test]
async fn failed_snapshot_creation_fails_the_job() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    fx.array.fail_next(Operation::Create, 5);

    let err = lc
        .snap_backup(&lc.context(), &BackupRequest::new(PRIMARY, "/vol/a"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArrayCommunication);
    let jobs = fx.registry.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(fx.registry.list_all().is_empty());
}

#[tokio::test]
async fn aging_deletes_expired_snapshots_through_the_controller() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let old = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(90))
        .await;
    let feeding = fx
        .seed_snapshot(PRIMARY, "/vol/b", BackupLevel::Full, ChronoDuration::days(80))
        .await;
    fx.seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(2))
        .await;
    fx.seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(1))
        .await;
    fx.registry.open_edge(feeding.id, VAULT).unwrap();

    let report = lc.run_aging(&lc.context(), AgingScope::All).await.unwrap();
    assert_eq!(report.deleted, vec![old.id]);
    assert_eq!(report.blocked, vec![feeding.id]);
    assert_eq!(fx.state_of(old.id), SnapshotState::Deleted);
    assert_eq!(fx.state_of(feeding.id), SnapshotState::Cataloged);
}

#[tokio::test]
async fn periodic_aging_stops_on_cancel() {
    let fx = Fixture::new();
    let config = fast_config();
    let config = LifecycleConfig {
        aging_interval_secs: 1,
        ..config
    };
    let lc = SnapLifecycle::new(
        config,
        Arc::clone(&fx.registry),
        fx.array_client(),
        fx.catalog_service(),
    )
    .unwrap();
    let old = fx
        .seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(90))
        .await;
    fx.seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(2))
        .await;
    fx.seed_snapshot(PRIMARY, "/vol/a", BackupLevel::Full, ChronoDuration::days(1))
        .await;

    let cancel = lc.spawn_aging(AgingScope::Copy(PRIMARY));
    // The first tick fires immediately.
    until(|| fx.state_of(old.id) == SnapshotState::Deleted).await;
    cancel.cancel();
}

#[tokio::test]
async fn registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let config = fast_config()
        .with_registry_path(&path)
        .with_policy(PolicyConfig {
            id: 9,
            name: "silver".into(),
            backup_copy_source: None,
            copies: vec![CopyConfig {
                id: 90,
                name: "Primary".into(),
                kind: CopyKind::Primary,
                retention_days: Some(7),
                retention_cycles: None,
                precedence: None,
            }],
        });
    let fx = Fixture::new();

    let id = {
        let lc = SnapLifecycle::open(config.clone(), fx.array_client(), fx.catalog_service()).unwrap();
        let snap = lc
            .snap_backup(&lc.context(), &BackupRequest::new(CopyId(90), "/vol/a"))
            .await
            .unwrap();
        snap.id
    };

    let lc = SnapLifecycle::open(config, fx.array_client(), fx.catalog_service()).unwrap();
    let snap = lc.registry().get(id).unwrap();
    assert_eq!(snap.state, SnapshotState::Cataloged);
    assert_eq!(lc.registry().copy(CopyId(90)).unwrap().retention.days, 7);
    assert_eq!(lc.verify_audit().unwrap(), 1);
}

#[tokio::test]
async fn separate_runs_never_reuse_array_handles() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config()
        .with_registry_path(dir.path().join("registry.json"))
        .with_policy(PolicyConfig {
            id: 9,
            name: "silver".into(),
            backup_copy_source: None,
            copies: vec![CopyConfig {
                id: 90,
                name: "Primary".into(),
                kind: CopyKind::Primary,
                retention_days: None,
                retention_cycles: None,
                precedence: None,
            }],
        });

    // Each run talks to a freshly started array client, like separate CLI
    // invocations do.
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let fx = Fixture::new();
        let lc = SnapLifecycle::open(config.clone(), fx.array_client(), fx.catalog_service()).unwrap();
        let snap = lc
            .snap_backup(&lc.context(), &BackupRequest::new(CopyId(90), "/vol/a"))
            .await
            .unwrap();
        snapshots.push(snap);
    }

    assert!(snapshots[0].handle.is_some());
    assert_ne!(snapshots[0].handle, snapshots[1].handle);
    let lc = SnapLifecycle::open(config, Fixture::new().array_client(), Fixture::new().catalog_service())
        .unwrap();
    for snap in &snapshots {
        assert_eq!(lc.registry().get(snap.id).unwrap().state, SnapshotState::Cataloged);
    }
}

#[tokio::test]
async fn audit_trail_covers_every_transition() {
    let fx = Fixture::new();
    let lc = lifecycle(&fx);
    let ctx = lc.context();
    let s1 = fx.primary_snapshot("/vol/a").await;
    lc.mount(&ctx, s1.id, &host("hostA"), AccessMode::ReadOnly)
        .await
        .unwrap();
    lc.unmount(&ctx, s1.id, &host("hostA")).await.unwrap();
    lc.delete(&ctx, s1.id).await.unwrap();

    let trail = fx.registry.audit().unwrap().for_snapshot(s1.id);
    let states: Vec<SnapshotState> = trail.iter().map(|r| r.to).collect();
    assert_eq!(
        states,
        vec![
            SnapshotState::Cataloged,
            SnapshotState::Mounted,
            SnapshotState::Unmounted,
            SnapshotState::Deleting,
            SnapshotState::Deleted,
        ]
    );
    assert!(trail[1..].iter().all(|r| r.correlation == Some(ctx.correlation)));
    assert_eq!(lc.verify_audit().unwrap(), 5);
}
