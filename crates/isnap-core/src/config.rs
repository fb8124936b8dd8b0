//! Lifecycle configuration, loaded from `isnapctl.toml`.
//!
//! ```toml
//! registry_path = "/var/lib/isnap/registry.json"
//! operation_timeout_secs = 600
//! aux_parallelism = 4
//! retired_retention_days = 30
//!
//! [retry]
//! attempts = 3
//! base_delay = 200
//! max_delay = 5000
//!
//! [[policies]]
//! id = 1
//! name = "gold"
//! backup_copy_source = "Vault"
//!
//! [[policies.copies]]
//! id = 1
//! name = "Primary"
//! kind = "primary"
//! retention_days = 7
//! retention_cycles = 1
//! ```

use crate::context::OperationContext;
use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::scheduler::RetryPolicy;
use isnap_kernel::types::{
    CopyId, CopyKind, PolicyCopy, RetentionPolicy, StoragePolicy, StoragePolicyId,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "ISNAP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "isnapctl.toml";

/// How often, and how many times, a post-operation verification reads the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl VerifyPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyConfig {
    pub id: u32,
    pub name: String,
    pub kind: CopyKind,
    pub retention_days: Option<u32>,
    pub retention_cycles: Option<u32>,
    /// Overrides the kind's default precedence rank
    pub precedence: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub id: u32,
    pub name: String,
    /// Copy name backup copy reads from; Primary when unset
    pub backup_copy_source: Option<String>,
    pub copies: Vec<CopyConfig>,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> SnapResult<StoragePolicy> {
        let policy = StoragePolicyId(self.id);
        let defaults = RetentionPolicy::default();
        let copies: Vec<PolicyCopy> = self
            .copies
            .iter()
            .map(|c| PolicyCopy {
                id: CopyId(c.id),
                name: c.name.clone(),
                policy,
                kind: c.kind,
                retention: RetentionPolicy {
                    days: c.retention_days.unwrap_or(defaults.days),
                    cycles: c.retention_cycles.unwrap_or(defaults.cycles),
                },
                precedence: c.precedence.unwrap_or_else(|| c.kind.default_rank()),
            })
            .collect();
        let backup_copy_source = match &self.backup_copy_source {
            None => None,
            Some(name) => Some(
                copies
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .map(|c| c.id)
                    .ok_or_else(|| {
                        SnapError::Config(format!(
                            "policy '{}': backup_copy_source '{name}' is not one of its copies",
                            self.name
                        ))
                    })?,
            ),
        };
        Ok(StoragePolicy {
            id: policy,
            name: self.name.clone(),
            copies,
            backup_copy_source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub registry_path: PathBuf,
    pub operation_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub mount_verify: VerifyPolicy,
    pub delete_verify: VerifyPolicy,
    /// Concurrent entries when aux copy runs scaled out
    pub aux_parallelism: usize,
    /// Mount paths are `<default_mount_path>/<snapshot id>`
    pub default_mount_path: String,
    pub aging_interval_secs: u64,
    /// Days a REVERTED or DELETED snapshot stays in the registry document
    pub retired_retention_days: u32,
    pub policies: Vec<PolicyConfig>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("isnap-registry.json"),
            operation_timeout_secs: 600,
            retry: RetryPolicy::default(),
            mount_verify: VerifyPolicy::new(5, Duration::from_secs(5)),
            // Every 2 minutes for up to 20 minutes.
            delete_verify: VerifyPolicy::new(10, Duration::from_secs(120)),
            aux_parallelism: 4,
            default_mount_path: "/mnt/isnap".to_string(),
            aging_interval_secs: 3600,
            retired_retention_days: 30,
            policies: Vec::new(),
        }
    }
}

impl LifecycleConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> SnapResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SnapError::Config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| SnapError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), policies = config.policies.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> SnapResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SnapError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Picks the configuration: explicit path, then `ISNAP_CONFIG`, then
    /// `isnapctl.toml` in the working directory if present, else defaults.
    pub fn discover(explicit: Option<&Path>) -> SnapResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> SnapResult<()> {
        if self.operation_timeout_secs == 0 {
            return Err(SnapError::Config("operation_timeout_secs must be positive".into()));
        }
        if self.retry.attempts == 0 {
            return Err(SnapError::Config("retry.attempts must be at least 1".into()));
        }
        if self.aux_parallelism == 0 {
            return Err(SnapError::Config("aux_parallelism must be at least 1".into()));
        }
        if self.mount_verify.attempts == 0 || self.delete_verify.attempts == 0 {
            return Err(SnapError::Config("verification attempts must be at least 1".into()));
        }
        for policy in &self.policies {
            policy.to_policy()?;
        }
        Ok(())
    }

    pub fn storage_policies(&self) -> SnapResult<Vec<StoragePolicy>> {
        self.policies.iter().map(PolicyConfig::to_policy).collect()
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs(self.aging_interval_secs)
    }

    pub fn retired_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retired_retention_days))
    }

    /// Fresh context carrying this configuration's timeout and retry policy
    pub fn context(&self) -> OperationContext {
        OperationContext::new()
            .with_timeout(self.operation_timeout())
            .with_retry(self.retry)
    }

    #[inline]
    #[must_use]
    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_mount_verify(mut self, verify: VerifyPolicy) -> Self {
        self.mount_verify = verify;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_delete_verify(mut self, verify: VerifyPolicy) -> Self {
        self.delete_verify = verify;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_aux_parallelism(mut self, parallelism: usize) -> Self {
        self.aux_parallelism = parallelism;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retired_retention_days(mut self, days: u32) -> Self {
        self.retired_retention_days = days;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policies.push(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
registry_path = "/tmp/isnap/registry.json"
aux_parallelism = 2

[delete_verify]
attempts = 3
interval_ms = 10

[[policies]]
id = 7
name = "gold"
backup_copy_source = "vault"

[[policies.copies]]
id = 70
name = "Primary"
kind = "primary"
retention_days = 7

[[policies.copies]]
id = 71
name = "Vault"
kind = "vault"
precedence = 1

[[policies.copies]]
id = 72
name = "Tape"
kind = "backup_copy"
"#;

    #[test]
    fn parses_policies_and_defaults() {
        let config = LifecycleConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.aux_parallelism, 2);
        assert_eq!(config.operation_timeout_secs, 600);
        assert_eq!(config.retired_retention(), chrono::Duration::days(30));
        assert_eq!(config.delete_verify.interval(), Duration::from_millis(10));

        let policies = config.storage_policies().unwrap();
        let gold = &policies[0];
        assert_eq!(gold.backup_copy_source, Some(CopyId(71)));
        let primary = gold.copy(CopyId(70)).unwrap();
        assert_eq!(primary.retention, RetentionPolicy { days: 7, cycles: 2 });
        assert_eq!(gold.copy(CopyId(71)).unwrap().precedence, 1);
        assert_eq!(gold.copy(CopyId(72)).unwrap().precedence, 3);
    }

    #[test]
    fn unknown_backup_copy_source_is_rejected() {
        let text = SAMPLE.replace("backup_copy_source = \"vault\"", "backup_copy_source = \"nope\"");
        let err = LifecycleConfig::from_toml_str(&text).unwrap_err();
        assert_eq!(err.kind(), isnap_kernel::ErrorKind::Config);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = LifecycleConfig::from_toml_str("aux_parallelism = 0").unwrap_err();
        assert!(err.to_string().contains("aux_parallelism"));
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let config =
            LifecycleConfig::from_toml_str(include_str!("../../../config/isnapctl.toml")).unwrap();
        let gold = &config.storage_policies().unwrap()[0];
        assert_eq!(gold.copies.len(), 4);
        assert_eq!(gold.backup_copy_source, Some(CopyId(2)));
        assert_eq!(config.delete_verify.interval(), Duration::from_secs(120));
    }
}
