//! Data aging: retention-driven deletion of expired snapshots.
//!
//! A snapshot expires once it is older than its copy's `days` AND at least
//! `cycles` newer full cycles exist on the same copy. Expired snapshots
//! that are still the source of an unfinished derived copy are left alone
//! until the derived copy stands on its own.
//!
//! With [`RetentionAgingScheduler::with_compaction`], a finished pass also
//! compacts the registry, dropping snapshots retired longer ago than the
//! configured window.

use crate::context::OperationContext;
use crate::delete::DeleteController;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use isnap_kernel::error::{SnapResult, SnapshotFailure};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Which copies an aging pass looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingScope {
    All,
    Policy(StoragePolicyId),
    Copy(CopyId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingReport {
    /// Snapshots considered (aging candidates only)
    pub examined: usize,
    pub deleted: Vec<SnapshotId>,
    /// Expired but still the source of an in-progress derived copy
    pub blocked: Vec<SnapshotId>,
    /// Not expired yet
    pub retained: usize,
    pub failed: Vec<SnapshotFailure>,
    /// The pass stopped early on cancellation
    pub cancelled: bool,
    /// Retired snapshots dropped from the registry after the pass
    #[serde(default)]
    pub compacted: usize,
}

#[async_trait]
pub trait DataAgingScheduler: Send + Sync {
    /// One aging pass. Per-snapshot failures are collected in the report and
    /// never stop the pass; cancellation is honoured between deletions.
    async fn run_aging(&self, ctx: &OperationContext, scope: AgingScope) -> SnapResult<AgingReport>;
}

pub struct RetentionAgingScheduler {
    registry: Arc<SnapshotRegistry>,
    deleter: Arc<dyn DeleteController>,
    compact_after: Option<ChronoDuration>,
}

/// States an aging pass may delete from.
fn is_candidate(state: SnapshotState) -> bool {
    matches!(
        state,
        SnapshotState::Cataloged | SnapshotState::Unmounted | SnapshotState::Stale
    )
}

/// Expiry rule for one snapshot given the newer cycle starts on its copy.
pub fn is_expired(
    point_in_time: DateTime<Utc>,
    retention: RetentionPolicy,
    newer_cycles: usize,
    now: DateTime<Utc>,
) -> bool {
    let age = now.signed_duration_since(point_in_time);
    age > ChronoDuration::days(i64::from(retention.days)) && newer_cycles >= retention.cycles as usize
}

impl RetentionAgingScheduler {
    pub fn new(registry: Arc<SnapshotRegistry>, deleter: Arc<dyn DeleteController>) -> Self {
        Self {
            registry,
            deleter,
            compact_after: None,
        }
    }

    /// Compact the registry after each uncancelled pass, dropping snapshots
    /// retired more than `window` ago.
    #[must_use]
    pub fn with_compaction(mut self, window: ChronoDuration) -> Self {
        self.compact_after = Some(window);
        self
    }

    fn copies_in(&self, scope: AgingScope) -> SnapResult<Vec<PolicyCopy>> {
        Ok(match scope {
            AgingScope::All => self
                .registry
                .policies()
                .into_iter()
                .flat_map(|p| p.copies)
                .collect(),
            AgingScope::Policy(id) => self.registry.policy(id)?.copies,
            AgingScope::Copy(id) => vec![self.registry.copy(id)?],
        })
    }

    /// Expired snapshots on `copy`, oldest first, plus how many candidates
    /// were retained.
    fn expired_on(&self, copy: &PolicyCopy, now: DateTime<Utc>) -> (Vec<Snapshot>, usize) {
        let live: Vec<Snapshot> = self
            .registry
            .list_by_copy(copy.id)
            .into_iter()
            .filter(|s| !s.state.is_retired() || s.state == SnapshotState::Stale)
            .collect();
        let mut levels: HashMap<JobId, BackupLevel> = HashMap::new();
        for snap in &live {
            if let Ok(job) = self.registry.job(snap.job) {
                levels.insert(snap.job, job.level);
            }
        }
        let starts_cycle = |s: &Snapshot| {
            !s.state.is_retired() && levels.get(&s.job).is_some_and(|l| l.starts_cycle())
        };

        let mut expired = Vec::new();
        let mut retained = 0;
        for snap in live.iter().filter(|s| is_candidate(s.state)) {
            let newer_cycles = live
                .iter()
                .filter(|t| (t.point_in_time, t.id) > (snap.point_in_time, snap.id) && starts_cycle(t))
                .count();
            if is_expired(snap.point_in_time, copy.retention, newer_cycles, now) {
                expired.push(snap.clone());
            } else {
                retained += 1;
            }
        }
        (expired, retained)
    }

    /// [`DataAgingScheduler::run_aging`] against an explicit clock.
    pub async fn run_aging_at(
        &self,
        ctx: &OperationContext,
        scope: AgingScope,
        now: DateTime<Utc>,
    ) -> SnapResult<AgingReport> {
        let mut report = AgingReport::default();
        'copies: for copy in self.copies_in(scope)? {
            let (expired, retained) = self.expired_on(&copy, now);
            report.examined += expired.len() + retained;
            report.retained += retained;
            tracing::debug!(copy = %copy.id, expired = expired.len(), retained, "Aging copy");

            for snap in expired {
                if ctx.cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'copies;
                }
                if let Some(edge) = self.registry.blocking_edge(snap.id) {
                    tracing::info!(
                        snapshot = %snap.id,
                        derived_copy = %edge.derived_copy,
                        "Expired snapshot still feeds a derived copy, skipping"
                    );
                    report.blocked.push(snap.id);
                    continue;
                }
                match self.deleter.delete(ctx, snap.id).await {
                    Ok(_) => report.deleted.push(snap.id),
                    Err(err) => {
                        tracing::warn!(
                            snapshot = %snap.id,
                            copy = %copy.id,
                            kind = err.kind().as_str(),
                            error = %err,
                            "Aging could not delete snapshot"
                        );
                        report.failed.push(SnapshotFailure::new(snap.id, &err));
                    }
                }
            }
        }
        if let Some(window) = self.compact_after.filter(|_| !report.cancelled) {
            match self.registry.compact(now - window) {
                Ok(c) => report.compacted = c.snapshots,
                Err(err) => tracing::warn!(error = %err, "Registry compaction failed"),
            }
        }
        tracing::info!(
            examined = report.examined,
            deleted = report.deleted.len(),
            blocked = report.blocked.len(),
            failed = report.failed.len(),
            compacted = report.compacted,
            cancelled = report.cancelled,
            correlation = %ctx.correlation,
            "Aging pass finished"
        );
        Ok(report)
    }

    /// Runs an aging pass every `every` until the returned token is
    /// cancelled. Cancelling also stops a pass in progress at its next
    /// checkpoint.
    pub fn spawn_periodic(
        self: Arc<Self>,
        ctx: OperationContext,
        scope: AgingScope,
        every: Duration,
    ) -> CancellationToken {
        let cancel = ctx.cancel.child_token();
        let ctx = ctx.with_cancel(cancel.clone());
        tokio::spawn(async move {
            self.aging_loop(ctx, scope, every).await;
        });
        cancel
    }

    async fn aging_loop(&self, ctx: OperationContext, scope: AgingScope, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = every.as_secs(), ?scope, "Aging task started");
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::info!("Aging task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let pass = ctx.child();
                    if let Err(err) = self.run_aging(&pass, scope).await {
                        tracing::error!(error = %err, "Aging pass failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DataAgingScheduler for RetentionAgingScheduler {
    async fn run_aging(&self, ctx: &OperationContext, scope: AgingScope) -> SnapResult<AgingReport> {
        self.run_aging_at(ctx, scope, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isnap_kernel::error::SnapError;
    use isnap_test_utils::{Fixture, GOLD, PRIMARY, VAULT};
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Deleter {}

        #[async_trait]
        impl DeleteController for Deleter {
            async fn delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot>;
            async fn force_delete(&self, ctx: &OperationContext, snapshot: SnapshotId) -> SnapResult<Snapshot>;
        }
    }

    async fn seed(fx: &Fixture, level: BackupLevel, days: i64) -> Snapshot {
        fx.seed_snapshot(PRIMARY, "/vol/data", level, ChronoDuration::days(days))
            .await
    }

    #[test]
    fn expiry_needs_both_age_and_cycles() {
        let now = Utc::now();
        let retention = RetentionPolicy { days: 30, cycles: 2 };
        let old = now - ChronoDuration::days(31);
        assert!(is_expired(old, retention, 2, now));
        assert!(!is_expired(old, retention, 1, now));
        assert!(!is_expired(now - ChronoDuration::days(29), retention, 5, now));
    }

    #[tokio::test]
    async fn deletes_only_snapshots_past_both_limits() {
        let fx = Fixture::new();
        let s1 = seed(&fx, BackupLevel::Full, 60).await;
        let s2 = seed(&fx, BackupLevel::Incremental, 45).await;
        let _s3 = seed(&fx, BackupLevel::Full, 40).await;
        let _s4 = seed(&fx, BackupLevel::Incremental, 10).await;
        let _s5 = seed(&fx, BackupLevel::Full, 1).await;

        let mut deleter = MockDeleter::new();
        let expected = vec![s1.id, s2.id];
        deleter
            .expect_delete()
            .withf(move |_, id| expected.contains(id))
            .times(2)
            .returning(|_, id| Ok(dummy(id)));

        let aging = RetentionAgingScheduler::new(Arc::clone(&fx.registry), Arc::new(deleter));
        let report = aging
            .run_aging(&OperationContext::new(), AgingScope::Copy(PRIMARY))
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![s1.id, s2.id]);
        assert_eq!(report.examined, 5);
        assert_eq!(report.retained, 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_pass() {
        let fx = Fixture::new();
        let s1 = seed(&fx, BackupLevel::Full, 90).await;
        let s2 = seed(&fx, BackupLevel::Full, 80).await;
        seed(&fx, BackupLevel::Full, 2).await;
        seed(&fx, BackupLevel::Full, 1).await;

        let mut deleter = MockDeleter::new();
        let first = s1.id;
        deleter.expect_delete().times(2).returning(move |_, id| {
            if id == first {
                Err(SnapError::ValidationFailure {
                    operation: Operation::Delete,
                    snapshot: id,
                    reason: "still present".into(),
                })
            } else {
                Ok(dummy(id))
            }
        });

        let aging = RetentionAgingScheduler::new(Arc::clone(&fx.registry), Arc::new(deleter));
        let report = aging
            .run_aging(&OperationContext::new(), AgingScope::Policy(GOLD))
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![s2.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].snapshot, s1.id);
        assert_eq!(report.failed[0].kind, isnap_kernel::ErrorKind::ValidationFailure);
    }

    #[tokio::test]
    async fn in_progress_edge_blocks_deletion() {
        let fx = Fixture::new();
        let s1 = seed(&fx, BackupLevel::Full, 90).await;
        seed(&fx, BackupLevel::Full, 2).await;
        seed(&fx, BackupLevel::Full, 1).await;
        fx.registry.open_edge(s1.id, VAULT).unwrap();

        let mut deleter = MockDeleter::new();
        deleter.expect_delete().never();
        let aging = RetentionAgingScheduler::new(Arc::clone(&fx.registry), Arc::new(deleter));
        let report = aging
            .run_aging(&OperationContext::new(), AgingScope::All)
            .await
            .unwrap();
        assert_eq!(report.blocked, vec![s1.id]);
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_deletions() {
        let fx = Fixture::new();
        seed(&fx, BackupLevel::Full, 90).await;
        seed(&fx, BackupLevel::Full, 80).await;
        seed(&fx, BackupLevel::Full, 2).await;
        seed(&fx, BackupLevel::Full, 1).await;

        let ctx = OperationContext::new();
        let cancel = ctx.cancel.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut deleter = MockDeleter::new();
        deleter.expect_delete().returning(move |_, id| {
            seen.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            Ok(dummy(id))
        });

        let aging = RetentionAgingScheduler::new(Arc::clone(&fx.registry), Arc::new(deleter));
        let report = aging.run_aging(&ctx, AgingScope::Copy(PRIMARY)).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.deleted.len(), 1);
    }

    #[tokio::test]
    async fn finished_pass_compacts_retired_snapshots() {
        let fx = Fixture::new();
        let s1 = seed(&fx, BackupLevel::Full, 90).await;
        let s2 = seed(&fx, BackupLevel::Full, 2).await;
        seed(&fx, BackupLevel::Full, 1).await;

        let registry = Arc::clone(&fx.registry);
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete()
            .times(1)
            .returning(move |_, id| registry.retire_missing(id, None));

        let aging = RetentionAgingScheduler::new(Arc::clone(&fx.registry), Arc::new(deleter))
            .with_compaction(ChronoDuration::zero());
        let report = aging
            .run_aging_at(
                &OperationContext::new(),
                AgingScope::Copy(PRIMARY),
                Utc::now() + ChronoDuration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![s1.id]);
        assert_eq!(report.compacted, 1);
        assert_eq!(
            fx.registry.get(s1.id).unwrap_err().kind(),
            isnap_kernel::ErrorKind::NotFound
        );
        assert_eq!(fx.registry.get(s2.id).unwrap().state, SnapshotState::Cataloged);
    }

    fn dummy(id: SnapshotId) -> Snapshot {
        Snapshot {
            id,
            job: JobId(0),
            copy: PRIMARY,
            volume: String::new(),
            handle: None,
            state: SnapshotState::Deleted,
            prior_state: None,
            point_in_time: Utc::now(),
            created_at: Utc::now(),
            last_validated_at: None,
            source: None,
            retired_at: None,
        }
    }
}
