//! isnap kernel (isnap-kernel)
//!
//! The shared core of the IntelliSnap copy lifecycle:
//! 1. **Registry**: durable snapshot, policy, job, mount and dependency
//!    records, with compare-and-swap transitions and operation leases
//! 2. **Collaborators**: traits for the array, its job manager and the
//!    catalog service, plus a simulated array for tests
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use isnap_kernel::prelude::*;
//!
//! let registry = SnapshotRegistry::open(Box::new(JsonFileStore::open("registry.json")?))?;
//! registry.define_policy(policy)?;
//! let job = registry.record_job(BackupLevel::Full, "sc1", "/vol/data", now())?;
//! let snap = registry.register(job.id, primary, Some(handle), None)?;
//! registry.compare_and_transition(snap.id, SnapshotState::Created, SnapshotEvent::Catalog, None)?;
//! ```

pub mod api;
pub mod error;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;

// Test harness
pub mod test_harness;

pub use api::*;
pub use error::*;
pub use types::*;

pub mod prelude {
    pub use crate::api::{ArrayClient, ArrayError, CatalogService, Job, JobHandle, SnapshotJob};
    pub use crate::error::{ErrorKind, SnapError, SnapResult, SnapshotFailure};
    pub use crate::logging::{AuditLog, ChainHead, TransitionRecord};
    pub use crate::registry::{
        CompactionReport, MountClaim, RevertOutcome, SnapshotLease, SnapshotRegistry,
    };
    pub use crate::scheduler::{poll_until, run_array_job, RetryPolicy};
    pub use crate::store::{JsonFileStore, MemoryStore, RegistryState, RegistryStore};
    pub use crate::types::*;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
