//! Error taxonomy for the snapshot lifecycle
//!
//! Every failing operation returns a [`SnapError`] carrying a stable
//! [`ErrorKind`] plus a human-readable reason. Only
//! [`ErrorKind::ArrayCommunication`] is retried internally; every other kind
//! propagates to the caller.

use crate::types::{
    ArrayHandle, ArrayJobId, CopyId, Destination, JobId, JobStatus, Operation, SnapshotEvent,
    SnapshotId, SnapshotState, StoragePolicyId, VolumeKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of error kinds callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ArrayCommunication,
    InvalidTransition,
    MountConflict,
    RevertInProgress,
    OperationInProgress,
    DependencyBlocked,
    ValidationFailure,
    NoEligibleCopy,
    BackupCopyFailed,
    JobFailed,
    TimedOut,
    DuplicateSnapshot,
    NotFound,
    Cancelled,
    Storage,
    Config,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ArrayCommunication => "array_communication",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::MountConflict => "mount_conflict",
            ErrorKind::RevertInProgress => "revert_in_progress",
            ErrorKind::OperationInProgress => "operation_in_progress",
            ErrorKind::DependencyBlocked => "dependency_blocked",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::NoEligibleCopy => "no_eligible_copy",
            ErrorKind::BackupCopyFailed => "backup_copy_failed",
            ErrorKind::JobFailed => "job_failed",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::DuplicateSnapshot => "duplicate_snapshot",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }

    /// Process exit code used by the command surface
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::InvalidTransition => 10,
            ErrorKind::DuplicateSnapshot => 11,
            ErrorKind::MountConflict => 20,
            ErrorKind::RevertInProgress => 21,
            ErrorKind::OperationInProgress => 22,
            ErrorKind::DependencyBlocked => 23,
            ErrorKind::ValidationFailure => 30,
            ErrorKind::NoEligibleCopy => 31,
            ErrorKind::BackupCopyFailed => 40,
            ErrorKind::JobFailed => 41,
            ErrorKind::TimedOut => 42,
            ErrorKind::ArrayCommunication => 50,
            ErrorKind::Cancelled => 60,
            ErrorKind::Storage => 70,
        }
    }

    /// Resource contention: the caller must wait (or unmount) and resubmit.
    pub fn is_contention(self) -> bool {
        matches!(
            self,
            ErrorKind::MountConflict
                | ErrorKind::RevertInProgress
                | ErrorKind::OperationInProgress
                | ErrorKind::DependencyBlocked
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a lookup failed to find
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Snapshot(SnapshotId),
    Copy(CopyId),
    CopyName(String),
    Policy(StoragePolicyId),
    PolicyName(String),
    Job(JobId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Snapshot(id) => write!(f, "snapshot {id}"),
            Missing::Copy(id) => write!(f, "copy {id}"),
            Missing::CopyName(name) => write!(f, "copy '{name}'"),
            Missing::Policy(id) => write!(f, "storage policy {id}"),
            Missing::PolicyName(name) => write!(f, "storage policy '{name}'"),
            Missing::Job(id) => write!(f, "backup job {id}"),
        }
    }
}

/// Lifecycle error
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapError {
    /// Transient array or network fault
    #[error("array communication failed during {operation}: {reason}")]
    ArrayCommunication {
        operation: Operation,
        snapshot: Option<SnapshotId>,
        reason: String,
    },

    /// The snapshot state machine rejected the event
    #[error("snapshot {snapshot} in state {from} cannot accept {event}")]
    InvalidTransition {
        snapshot: SnapshotId,
        from: SnapshotState,
        event: SnapshotEvent,
    },

    #[error("snapshot {snapshot} already has a mount on {destination}")]
    MountConflict {
        snapshot: SnapshotId,
        destination: Destination,
    },

    #[error("volume chain {volume} is locked by a revert of {reverting}")]
    RevertInProgress {
        volume: VolumeKey,
        reverting: SnapshotId,
    },

    #[error("snapshot {snapshot} is busy with {operation}")]
    OperationInProgress {
        snapshot: SnapshotId,
        operation: Operation,
    },

    /// The snapshot is still the source of an unfinished derived copy
    #[error("snapshot {snapshot} is the source of an in-progress copy to {derived_copy}")]
    DependencyBlocked {
        snapshot: SnapshotId,
        derived_copy: CopyId,
        derived_snapshot: Option<SnapshotId>,
    },

    /// Post-operation verification did not match expectation
    #[error("{operation} validation failed for snapshot {snapshot}: {reason}")]
    ValidationFailure {
        operation: Operation,
        snapshot: SnapshotId,
        reason: String,
    },

    #[error("no eligible copy in storage policy {policy}{}", .preferred.map(|c| format!(" (preferred {c})")).unwrap_or_default())]
    NoEligibleCopy {
        policy: StoragePolicyId,
        preferred: Option<CopyId>,
    },

    #[error("backup copy job {job} for {policy} ended with status '{status}': {reason}")]
    BackupCopyFailed {
        policy: StoragePolicyId,
        job: ArrayJobId,
        status: JobStatus,
        reason: String,
    },

    #[error("{operation} job {job} ended with status '{status}': {reason}")]
    JobFailed {
        operation: Operation,
        job: ArrayJobId,
        snapshot: Option<SnapshotId>,
        status: JobStatus,
        reason: String,
    },

    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    TimedOut {
        operation: Operation,
        snapshot: Option<SnapshotId>,
        timeout: Duration,
    },

    #[error("backup job {job} already has snapshot {existing} on {copy}")]
    DuplicateSnapshot {
        job: JobId,
        copy: CopyId,
        existing: SnapshotId,
    },

    #[error("array handle {handle} is already held by snapshot {existing}")]
    DuplicateHandle {
        handle: ArrayHandle,
        existing: SnapshotId,
    },

    #[error("audit trail broken at record {seq}")]
    AuditBroken { seq: u64 },

    #[error("{0} not found")]
    NotFound(Missing),

    #[error("operation cancelled")]
    Cancelled,

    #[error("registry storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SnapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapError::ArrayCommunication { .. } => ErrorKind::ArrayCommunication,
            SnapError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            SnapError::MountConflict { .. } => ErrorKind::MountConflict,
            SnapError::RevertInProgress { .. } => ErrorKind::RevertInProgress,
            SnapError::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            SnapError::DependencyBlocked { .. } => ErrorKind::DependencyBlocked,
            SnapError::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            SnapError::NoEligibleCopy { .. } => ErrorKind::NoEligibleCopy,
            SnapError::BackupCopyFailed { .. } => ErrorKind::BackupCopyFailed,
            SnapError::JobFailed { .. } => ErrorKind::JobFailed,
            SnapError::TimedOut { .. } => ErrorKind::TimedOut,
            SnapError::DuplicateSnapshot { .. } | SnapError::DuplicateHandle { .. } => {
                ErrorKind::DuplicateSnapshot
            }
            SnapError::AuditBroken { .. } => ErrorKind::ValidationFailure,
            SnapError::NotFound(_) => ErrorKind::NotFound,
            SnapError::Cancelled => ErrorKind::Cancelled,
            SnapError::Storage(_) => ErrorKind::Storage,
            SnapError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only transient array faults are retried.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ArrayCommunication
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Snapshot the error is about, when there is one
    pub fn snapshot(&self) -> Option<SnapshotId> {
        match self {
            SnapError::ArrayCommunication { snapshot, .. }
            | SnapError::JobFailed { snapshot, .. }
            | SnapError::TimedOut { snapshot, .. } => *snapshot,
            SnapError::InvalidTransition { snapshot, .. }
            | SnapError::MountConflict { snapshot, .. }
            | SnapError::OperationInProgress { snapshot, .. }
            | SnapError::DependencyBlocked { snapshot, .. }
            | SnapError::ValidationFailure { snapshot, .. } => Some(*snapshot),
            SnapError::RevertInProgress { reverting, .. } => Some(*reverting),
            SnapError::DuplicateSnapshot { existing, .. }
            | SnapError::DuplicateHandle { existing, .. } => Some(*existing),
            SnapError::NotFound(Missing::Snapshot(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn snapshot_not_found(id: SnapshotId) -> Self {
        SnapError::NotFound(Missing::Snapshot(id))
    }

    pub fn copy_not_found(id: CopyId) -> Self {
        SnapError::NotFound(Missing::Copy(id))
    }

    pub fn policy_not_found(id: StoragePolicyId) -> Self {
        SnapError::NotFound(Missing::Policy(id))
    }

    /// Attach a snapshot id to errors raised below the snapshot level.
    #[must_use]
    pub fn for_snapshot(self, id: SnapshotId) -> Self {
        match self {
            SnapError::ArrayCommunication {
                operation, reason, ..
            } => SnapError::ArrayCommunication {
                operation,
                snapshot: Some(id),
                reason,
            },
            SnapError::JobFailed {
                operation,
                job,
                status,
                reason,
                ..
            } => SnapError::JobFailed {
                operation,
                job,
                snapshot: Some(id),
                status,
                reason,
            },
            SnapError::TimedOut {
                operation, timeout, ..
            } => SnapError::TimedOut {
                operation,
                snapshot: Some(id),
                timeout,
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for SnapError {
    fn from(value: std::io::Error) -> Self {
        SnapError::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for SnapError {
    fn from(value: serde_json::Error) -> Self {
        SnapError::Storage(value.to_string())
    }
}

/// Structured failure report for one snapshot inside a multi-snapshot operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFailure {
    pub snapshot: SnapshotId,
    pub kind: ErrorKind,
    pub reason: String,
}

impl SnapshotFailure {
    pub fn new(snapshot: SnapshotId, error: &SnapError) -> Self {
        Self {
            snapshot,
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

pub type SnapResult<T> = Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_array_communication_is_retryable() {
        let transient = SnapError::ArrayCommunication {
            operation: Operation::Mount,
            snapshot: None,
            reason: "connection reset".into(),
        };
        assert!(transient.is_retryable());

        let conflict = SnapError::MountConflict {
            snapshot: SnapshotId(1),
            destination: Destination::new("hostA"),
        };
        assert!(!conflict.is_retryable());
        assert!(conflict.kind().is_contention());
    }

    #[test]
    fn for_snapshot_attaches_context() {
        let err = SnapError::TimedOut {
            operation: Operation::Delete,
            snapshot: None,
            timeout: Duration::from_secs(5),
        }
        .for_snapshot(SnapshotId(9));
        assert_eq!(err.snapshot(), Some(SnapshotId(9)));
        assert_eq!(err.kind().as_str(), "timed_out");
        assert_eq!(err.to_string(), "delete timed out after 5000ms");
    }

    #[test]
    fn exit_codes_are_distinct() {
        use std::collections::HashSet;
        let kinds = [
            ErrorKind::ArrayCommunication,
            ErrorKind::InvalidTransition,
            ErrorKind::MountConflict,
            ErrorKind::RevertInProgress,
            ErrorKind::OperationInProgress,
            ErrorKind::DependencyBlocked,
            ErrorKind::ValidationFailure,
            ErrorKind::NoEligibleCopy,
            ErrorKind::BackupCopyFailed,
            ErrorKind::JobFailed,
            ErrorKind::TimedOut,
            ErrorKind::DuplicateSnapshot,
            ErrorKind::NotFound,
            ErrorKind::Cancelled,
            ErrorKind::Storage,
            ErrorKind::Config,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }
}
