//! Per-request operation context.

use isnap_kernel::error::{SnapError, SnapResult};
use isnap_kernel::scheduler::RetryPolicy;
use isnap_kernel::types::StoragePolicyId;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an operation needs that is not its direct arguments.
///
/// Passed explicitly to every controller call; there is no global state.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub policy: Option<StoragePolicyId>,
    /// Budget for one array job, submission retries included
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    /// Correlates log lines and audit records of one request
    pub correlation: Uuid,
    /// Name of the credential set the array client was built with.
    /// Never the secret itself.
    pub credentials: Option<String>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self {
            policy: None,
            timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            correlation: Uuid::new_v4(),
            credentials: None,
        }
    }
}

impl OperationContext {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: StoragePolicyId) -> Self {
        self.policy = Some(policy);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_credentials(mut self, name: impl Into<String>) -> Self {
        self.credentials = Some(name.into());
        self
    }

    /// Same settings, fresh correlation id, cancelled with the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            correlation: Uuid::new_v4(),
            ..self.clone()
        }
    }

    pub fn correlation(&self) -> Option<Uuid> {
        Some(self.correlation)
    }

    pub fn check_cancelled(&self) -> SnapResult<()> {
        if self.cancel.is_cancelled() {
            Err(SnapError::Cancelled)
        } else {
            Ok(())
        }
    }
}
