//! isnap core
//!
//! The IntelliSnap copy lifecycle on top of `isnap-kernel`:
//! - Mount, revert and delete controllers that drive the array
//! - Aux copy and backup copy engines producing derived snapshots
//! - Copy precedence resolution for restores
//! - Retention-driven data aging
//!
//! # Example
//!
//! ```rust,ignore
//! use isnap_core::prelude::*;
//!
//! # async fn example(array: Arc<dyn ArrayClient>, catalog: Arc<dyn CatalogService>) -> SnapResult<()> {
//! let config = LifecycleConfig::discover(None)?;
//! let lifecycle = SnapLifecycle::open(config, array, catalog)?;
//! let ctx = lifecycle.context();
//!
//! let snap = lifecycle.snap_backup(&ctx, &BackupRequest::new(CopyId(1), "/vol/data")).await?;
//! lifecycle.mount(&ctx, snap.id, &Destination::new("hostA"), AccessMode::ReadOnly).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod aging;
pub mod aux_copy;
pub mod backup_copy;
mod catalog;
pub mod config;
pub mod context;
pub mod copy;
pub mod delete;
pub mod lifecycle;
pub mod mount;
pub mod resolver;
pub mod revert;

pub use aging::{AgingReport, AgingScope, DataAgingScheduler, RetentionAgingScheduler};
pub use aux_copy::{ArrayAuxCopyEngine, AuxCopyEngine};
pub use backup_copy::{ArrayBackupCopyEngine, BackupCopyEngine};
pub use config::{LifecycleConfig, PolicyConfig, VerifyPolicy};
pub use context::OperationContext;
pub use copy::{CopiedSnapshot, CopyReport};
pub use delete::{ArrayDeleteController, DeleteController};
pub use lifecycle::{BackupRequest, ReconcileReport, SnapLifecycle};
pub use mount::{ArrayMountController, MountController};
pub use resolver::{CopyPrecedenceResolver, RegistryResolver};
pub use revert::{ArrayRevertController, RevertController};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        AgingReport, AgingScope, AuxCopyEngine, BackupCopyEngine, BackupRequest,
        CopyPrecedenceResolver, CopyReport, DataAgingScheduler, DeleteController, LifecycleConfig,
        MountController, OperationContext, RevertController, SnapLifecycle,
    };
    pub use isnap_kernel::prelude::*;
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
