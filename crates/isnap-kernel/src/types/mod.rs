use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry-assigned snapshot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

/// Backup job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

/// Identifier of a job submitted to the array/job manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayJobId(pub u64);

/// Storage policy copy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CopyId(pub u32);

/// Storage policy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoragePolicyId(pub u32);

macro_rules! display_id {
    ($($ty:ty => $prefix:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )*
    };
}

display_id! {
    SnapshotId => "snap-",
    JobId => "job-",
    ArrayJobId => "ajob-",
    CopyId => "copy-",
    StoragePolicyId => "sp-",
}

/// Host a snapshot is exposed to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub String);

impl Destination {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque array-side reference to a snapshot (or to backup-copy media)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayHandle(pub String);

impl fmt::Display for ArrayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A snapshot chain: every snapshot of one volume on one copy.
///
/// Revert ordering and invalidation are scoped to a chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeKey {
    pub copy: CopyId,
    pub volume: String,
}

impl VolumeKey {
    pub fn new(copy: CopyId, volume: impl Into<String>) -> Self {
        Self {
            copy,
            volume: volume.into(),
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.copy, self.volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupLevel {
    Full,
    Incremental,
    Differential,
    SyntheticFull,
}

impl BackupLevel {
    /// Full and synthetic full backups start a new retention cycle.
    pub fn starts_cycle(self) -> bool {
        matches!(self, BackupLevel::Full | BackupLevel::SyntheticFull)
    }
}

/// Terminal and non-terminal job states, as reported by the job manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::CompletedWithErrors => "Completed w/ one or more errors",
            JobStatus::Failed => "Failed",
            JobStatus::Killed => "Killed",
        };
        f.write_str(s)
    }
}

/// A backup job that captured array snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: JobId,
    pub level: BackupLevel,
    pub subclient: String,
    pub volume: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyKind {
    Primary,
    Vault,
    BackupCopy,
    Aux,
}

impl CopyKind {
    /// Default precedence rank when configuration does not set one.
    pub fn default_rank(self) -> u32 {
        match self {
            CopyKind::Primary => 1,
            CopyKind::Vault => 2,
            CopyKind::BackupCopy => 3,
            CopyKind::Aux => 4,
        }
    }
}

impl fmt::Display for CopyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CopyKind::Primary => "primary",
            CopyKind::Vault => "vault",
            CopyKind::BackupCopy => "backup_copy",
            CopyKind::Aux => "aux",
        };
        f.write_str(s)
    }
}

/// Per-copy retention: a snapshot must be older than `days` and have
/// at least `cycles` newer full cycles before it ages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub days: u32,
    pub cycles: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { days: 30, cycles: 2 }
    }
}

/// A storage policy copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCopy {
    pub id: CopyId,
    pub name: String,
    pub policy: StoragePolicyId,
    pub kind: CopyKind,
    pub retention: RetentionPolicy,
    pub precedence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub id: StoragePolicyId,
    pub name: String,
    pub copies: Vec<PolicyCopy>,
    /// Source copy for backup copy; Primary when unset.
    pub backup_copy_source: Option<CopyId>,
}

impl StoragePolicy {
    pub fn copy(&self, id: CopyId) -> Option<&PolicyCopy> {
        self.copies.iter().find(|c| c.id == id)
    }

    pub fn copy_by_name(&self, name: &str) -> Option<&PolicyCopy> {
        self.copies
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn first_of_kind(&self, kind: CopyKind) -> Option<&PolicyCopy> {
        self.copies
            .iter()
            .filter(|c| c.kind == kind)
            .min_by_key(|c| (c.precedence, c.id))
    }

    /// Copies sorted by precedence rank (ties broken by id).
    pub fn copies_by_precedence(&self) -> Vec<&PolicyCopy> {
        let mut copies: Vec<&PolicyCopy> = self.copies.iter().collect();
        copies.sort_by_key(|c| (c.precedence, c.id));
        copies
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Created,
    Cataloged,
    Mounted,
    Unmounted,
    Reverted,
    Stale,
    Deleting,
    Deleted,
}

impl SnapshotState {
    /// States a restore or browse can be served from.
    pub fn is_restorable(self) -> bool {
        matches!(
            self,
            SnapshotState::Cataloged | SnapshotState::Mounted | SnapshotState::Unmounted
        )
    }

    /// Retired snapshots no longer occupy their (job, copy) slot.
    pub fn is_retired(self) -> bool {
        matches!(
            self,
            SnapshotState::Stale | SnapshotState::Reverted | SnapshotState::Deleted
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SnapshotState::Reverted | SnapshotState::Deleted)
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Created => "CREATED",
            SnapshotState::Cataloged => "CATALOGED",
            SnapshotState::Mounted => "MOUNTED",
            SnapshotState::Unmounted => "UNMOUNTED",
            SnapshotState::Reverted => "REVERTED",
            SnapshotState::Stale => "STALE",
            SnapshotState::Deleting => "DELETING",
            SnapshotState::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Inputs to the snapshot state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotEvent {
    Catalog,
    Mount,
    Unmount,
    Revert,
    Invalidate,
    BeginDelete,
    ConfirmDelete,
    AbortDelete,
}

impl fmt::Display for SnapshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A snapshot (or materialized backup-copy entry) on one copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub job: JobId,
    pub copy: CopyId,
    pub volume: String,
    pub handle: Option<ArrayHandle>,
    pub state: SnapshotState,
    /// State to restore if a delete is aborted.
    pub prior_state: Option<SnapshotState>,
    /// Point in time the data represents (the backup job's start).
    pub point_in_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Snapshot this entry was replicated or materialized from.
    pub source: Option<SnapshotId>,
    /// When the snapshot reached REVERTED or DELETED.
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn volume_key(&self) -> VolumeKey {
        VolumeKey::new(self.copy, self.volume.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Array mount call in flight
    Pending,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub snapshot: SnapshotId,
    pub destination: Destination,
    pub mount_path: String,
    pub access: AccessMode,
    pub lease: LeaseState,
    pub mounted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    InProgress,
    Materialized,
    Failed,
}

/// Source -> derived copy relationship for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source_copy: CopyId,
    pub source_snapshot: SnapshotId,
    pub derived_copy: CopyId,
    pub derived_snapshot: Option<SnapshotId>,
    pub state: EdgeState,
    pub opened_at: DateTime<Utc>,
}

impl DependencyEdge {
    pub fn is_blocking(&self) -> bool {
        self.state == EdgeState::InProgress
    }
}

/// Lifecycle operations, used for leases, errors and array calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Catalog,
    Mount,
    Unmount,
    Revert,
    Delete,
    Replicate,
    Materialize,
    Reconcile,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Catalog => "catalog",
            Operation::Mount => "mount",
            Operation::Unmount => "unmount",
            Operation::Revert => "revert",
            Operation::Delete => "delete",
            Operation::Replicate => "replicate",
            Operation::Materialize => "materialize",
            Operation::Reconcile => "reconcile",
        };
        f.write_str(s)
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
