//! Copy precedence: which copy of a storage policy serves a restore.

use chrono::{DateTime, Utc};
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::registry::SnapshotRegistry;
use isnap_kernel::types::{CopyId, StoragePolicyId};
use std::sync::Arc;

pub trait CopyPrecedenceResolver: Send + Sync {
    /// Copies holding at least one restorable snapshot taken at or before
    /// `as_of` (latest when `None`), best first.
    ///
    /// # Errors
    /// `NoEligibleCopy` when no copy qualifies.
    fn resolve(
        &self,
        policy: StoragePolicyId,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<Vec<CopyId>>;

    /// The copy a restore should read from.
    ///
    /// # Errors
    /// `NoEligibleCopy` when nothing qualifies, or when `preferred` is given
    /// but holds no restorable snapshot. There is no silent fallback.
    fn resolve_for_restore(
        &self,
        policy: StoragePolicyId,
        preferred: Option<CopyId>,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<CopyId>;
}

#[derive(Debug, Clone)]
pub struct RegistryResolver {
    registry: Arc<SnapshotRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<SnapshotRegistry>) -> Self {
        Self { registry }
    }

    fn has_restorable(&self, copy: CopyId, as_of: Option<DateTime<Utc>>) -> bool {
        self.registry.list_by_copy(copy).iter().any(|s| {
            s.state.is_restorable() && as_of.map_or(true, |t| s.point_in_time <= t)
        })
    }

    /// Copies with a restorable snapshot, best first; may be empty.
    fn eligible(&self, policy: StoragePolicyId, as_of: Option<DateTime<Utc>>) -> SnapResult<Vec<CopyId>> {
        let policy = self.registry.policy(policy)?;
        Ok(policy
            .copies_by_precedence()
            .into_iter()
            .filter(|c| self.has_restorable(c.id, as_of))
            .map(|c| c.id)
            .collect())
    }
}

impl CopyPrecedenceResolver for RegistryResolver {
    fn resolve(
        &self,
        policy: StoragePolicyId,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<Vec<CopyId>> {
        let eligible = self.eligible(policy, as_of)?;
        if eligible.is_empty() {
            return Err(SnapError::NoEligibleCopy {
                policy,
                preferred: None,
            });
        }
        Ok(eligible)
    }

    fn resolve_for_restore(
        &self,
        policy: StoragePolicyId,
        preferred: Option<CopyId>,
        as_of: Option<DateTime<Utc>>,
    ) -> SnapResult<CopyId> {
        let eligible = self.eligible(policy, as_of)?;
        let chosen = match preferred {
            Some(copy) => {
                if self.registry.policy(policy)?.copy(copy).is_none() {
                    return Err(SnapError::copy_not_found(copy));
                }
                eligible.into_iter().find(|c| *c == copy)
            }
            None => eligible.into_iter().next(),
        };
        let copy = chosen.ok_or(SnapError::NoEligibleCopy { policy, preferred })?;
        tracing::debug!(policy = %policy, copy = %copy, preferred = ?preferred, "Restore copy resolved");
        Ok(copy)
    }
}
