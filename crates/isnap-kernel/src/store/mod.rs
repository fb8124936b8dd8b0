//! Durable backing for the snapshot registry.
//!
//! The registry keeps its live state as one document. [`JsonFileStore`]
//! persists it as `<path>` (JSON), written atomically through
//! `<path>.tmp` + rename, and holds an advisory lock on `<path>.lock` for
//! as long as the store is open so two processes never interleave writes.
//!
//! Audit records are not part of the document. They are appended to
//! `<path>.audit.jsonl`, one JSON record per line, and never rewritten.

use crate::error::{SnapError, SnapResult};
use crate::logging::{ChainHead, TransitionRecord};
use crate::types::{
    BackupJob, DependencyEdge, JobId, LeaseState, MountPoint, Snapshot, SnapshotId,
    StoragePolicy, StoragePolicyId,
};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const STATE_VERSION: u32 = 2;

/// Everything the registry knows, as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryState {
    pub version: u32,
    pub next_snapshot: u64,
    pub next_job: u64,
    pub policies: BTreeMap<StoragePolicyId, StoragePolicy>,
    pub jobs: BTreeMap<JobId, BackupJob>,
    pub snapshots: BTreeMap<SnapshotId, Snapshot>,
    pub mounts: Vec<MountPoint>,
    pub edges: Vec<DependencyEdge>,
    #[serde(default)]
    pub audit_head: ChainHead,
    /// Records produced by the commit in progress
    #[serde(skip)]
    pub(crate) pending_audit: Vec<TransitionRecord>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            next_snapshot: 1,
            next_job: 1,
            policies: BTreeMap::new(),
            jobs: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            mounts: Vec::new(),
            edges: Vec::new(),
            audit_head: ChainHead::default(),
            pending_audit: Vec::new(),
        }
    }
}

impl RegistryState {
    /// Drops claims that only made sense inside the process that wrote them.
    pub(crate) fn discard_in_flight(&mut self) {
        self.mounts.retain(|m| m.lease == LeaseState::Active);
    }
}

/// Persistence seam for [`crate::registry::SnapshotRegistry`]
pub trait RegistryStore: Send + Sync {
    /// Returns `None` when nothing has been persisted yet.
    fn load(&self) -> SnapResult<Option<RegistryState>>;

    fn save(&self, state: &RegistryState) -> SnapResult<()>;

    /// Appends to the audit trail. Earlier records are never touched.
    fn append_audit(&self, records: &[TransitionRecord]) -> SnapResult<()>;

    fn load_audit(&self) -> SnapResult<Vec<TransitionRecord>>;

    fn describe(&self) -> String;
}

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<RegistryState>>,
    audit: Mutex<Vec<TransitionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RegistryState) -> Self {
        Self {
            saved: Mutex::new(Some(state)),
            audit: Mutex::default(),
        }
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> SnapResult<Option<RegistryState>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, state: &RegistryState) -> SnapResult<()> {
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }

    fn append_audit(&self, records: &[TransitionRecord]) -> SnapResult<()> {
        self.audit.lock().extend_from_slice(records);
        Ok(())
    }

    fn load_audit(&self) -> SnapResult<Vec<TransitionRecord>> {
        Ok(self.audit.lock().clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// JSON document on disk, guarded by an advisory lock file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    audit_path: PathBuf,
    // Held for the lifetime of the store; unlocked on drop.
    lock: File,
}

impl JsonFileStore {
    /// Opens (or prepares) the registry at `path`.
    ///
    /// # Errors
    /// `SnapError::Storage` if the directory cannot be created or another
    /// process holds the lock.
    pub fn open(path: impl AsRef<Path>) -> SnapResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| SnapError::Storage(format!("create {}: {e}", dir.display())))?;
        }
        let lock_path = sidecar(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| SnapError::Storage(format!("open {}: {e}", lock_path.display())))?;
        lock.try_lock_exclusive().map_err(|e| {
            SnapError::Storage(format!(
                "registry {} is locked by another process: {e}",
                path.display()
            ))
        })?;
        let audit_path = sidecar(&path, "audit.jsonl");
        Ok(Self {
            path,
            audit_path,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> SnapResult<Option<RegistryState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .map_err(|e| SnapError::Storage(format!("read {}: {e}", self.path.display())))?;
        let state: RegistryState = serde_json::from_slice(&bytes).map_err(|e| {
            SnapError::Storage(format!("parse {}: {e}", self.path.display()))
        })?;
        if state.version > STATE_VERSION {
            return Err(SnapError::Storage(format!(
                "{} has state version {}, newest supported is {STATE_VERSION}",
                self.path.display(),
                state.version
            )));
        }
        Ok(Some(state))
    }

    fn save(&self, state: &RegistryState) -> SnapResult<()> {
        let tmp = sidecar(&self.path, "tmp");
        let data = serde_json::to_vec_pretty(state)?;
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|e| SnapError::Storage(format!("open {}: {e}", tmp.display())))?;
        f.write_all(&data)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            SnapError::Storage(format!(
                "rename {} -> {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })?;
        Ok(())
    }

    fn append_audit(&self, records: &[TransitionRecord]) -> SnapResult<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .map_err(|e| SnapError::Storage(format!("open {}: {e}", self.audit_path.display())))?;
        f.write_all(&buf)?;
        f.sync_data()?;
        Ok(())
    }

    fn load_audit(&self) -> SnapResult<Vec<TransitionRecord>> {
        let f = match File::open(&self.audit_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SnapError::Storage(format!(
                    "open {}: {e}",
                    self.audit_path.display()
                )))
            }
        };
        let mut records = Vec::new();
        for (n, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                SnapError::Storage(format!("{} line {}: {e}", self.audit_path.display(), n + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}
