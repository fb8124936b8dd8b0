//! Testing utilities for the isnap workspace
//!
//! Shared fixtures: a four-copy storage policy, a registry wired to the
//! simulated array, and helpers that seed cataloged snapshots.

#![allow(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use isnap_kernel::prelude::*;
use isnap_kernel::test_harness::{SimulatedArray, SimulatedCatalog};
use std::sync::Arc;
use std::time::Duration;

pub const GOLD: StoragePolicyId = StoragePolicyId(1);
pub const PRIMARY: CopyId = CopyId(1);
pub const VAULT: CopyId = CopyId(2);
pub const BACKUP_COPY: CopyId = CopyId(3);
pub const AUX: CopyId = CopyId(4);

pub fn policy_copy(id: CopyId, name: &str, kind: CopyKind) -> PolicyCopy {
    PolicyCopy {
        id,
        name: name.to_string(),
        policy: GOLD,
        kind,
        retention: RetentionPolicy::default(),
        precedence: kind.default_rank(),
    }
}

/// Primary, Vault, BackupCopy and Aux copies with default precedence.
pub fn gold_policy() -> StoragePolicy {
    StoragePolicy {
        id: GOLD,
        name: "gold".to_string(),
        copies: vec![
            policy_copy(PRIMARY, "Primary", CopyKind::Primary),
            policy_copy(VAULT, "Vault", CopyKind::Vault),
            policy_copy(BACKUP_COPY, "BackupCopy", CopyKind::BackupCopy),
            policy_copy(AUX, "Aux", CopyKind::Aux),
        ],
        backup_copy_source: None,
    }
}

/// Registry plus simulated collaborators
#[derive(Clone)]
pub struct Fixture {
    pub registry: Arc<SnapshotRegistry>,
    pub array: SimulatedArray,
    pub catalog: SimulatedCatalog,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::with_policy(gold_policy())
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: StoragePolicy) -> Self {
        let registry = SnapshotRegistry::in_memory();
        registry
            .define_policy(policy)
            .expect("fixture policy is valid");
        Self {
            registry: Arc::new(registry),
            array: SimulatedArray::new(),
            catalog: SimulatedCatalog::new(),
        }
    }

    pub fn array_client(&self) -> Arc<dyn ArrayClient> {
        Arc::new(self.array.clone())
    }

    pub fn catalog_service(&self) -> Arc<dyn CatalogService> {
        Arc::new(self.catalog.clone())
    }

    /// Takes an array snapshot of `volume` and registers it CATALOGED on
    /// `copy`, as if a backup job of `level` started `age` ago.
    pub async fn seed_snapshot(
        &self,
        copy: CopyId,
        volume: &str,
        level: BackupLevel,
        age: ChronoDuration,
    ) -> Snapshot {
        self.seed_snapshot_at(copy, volume, level, Utc::now() - age).await
    }

    pub async fn seed_snapshot_at(
        &self,
        copy: CopyId,
        volume: &str,
        level: BackupLevel,
        started_at: DateTime<Utc>,
    ) -> Snapshot {
        let job = self
            .registry
            .record_job(level, "subclient1", volume, started_at)
            .expect("record job");
        let created = self.array.create_snapshot(volume).await.expect("create");
        assert!(created.job.wait_for_completion(Duration::from_secs(5)).await);
        let snap = self
            .registry
            .register(job.id, copy, Some(created.handle), None)
            .expect("register");
        self.registry
            .finish_job(job.id, JobStatus::Completed)
            .expect("finish job");
        self.registry
            .compare_and_transition(snap.id, SnapshotState::Created, SnapshotEvent::Catalog, None)
            .expect("catalog")
    }

    /// Shorthand for a fresh Full backup on the primary copy.
    pub async fn primary_snapshot(&self, volume: &str) -> Snapshot {
        self.seed_snapshot(PRIMARY, volume, BackupLevel::Full, ChronoDuration::minutes(1))
            .await
    }

    pub fn state_of(&self, id: SnapshotId) -> SnapshotState {
        self.registry.get(id).expect("snapshot exists").state
    }
}
