//! Submitting array jobs and waiting for them.
//!
//! Every array-facing call in the lifecycle goes through [`run_array_job`]:
//! submission is retried on transient communication faults with bounded
//! exponential backoff, then the returned job is awaited against the
//! caller's deadline. A job that ends in anything but `Completed` surfaces
//! as [`SnapError::JobFailed`] carrying the job manager's delay reason.

use crate::api::{ArrayError, Job, JobHandle, SnapshotJob};
use crate::error::{SnapError, SnapResult};
use crate::types::{ArrayJobId, JobStatus, Operation, SnapshotId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};

/// Bounded exponential backoff for transient array faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = (capped.as_millis() / 4) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Anything the array returns that carries a pollable job
pub trait Submitted {
    fn job(&self) -> &dyn JobHandle;
}

impl Submitted for Job {
    fn job(&self) -> &dyn JobHandle {
        &**self
    }
}

impl Submitted for SnapshotJob {
    fn job(&self) -> &dyn JobHandle {
        self.job.as_ref()
    }
}

fn array_error(operation: Operation, snapshot: Option<SnapshotId>, err: ArrayError) -> SnapError {
    match err {
        ArrayError::Communication(reason) => SnapError::ArrayCommunication {
            operation,
            snapshot,
            reason,
        },
        // Never got a job id; report it against the null job.
        ArrayError::Rejected(reason) => SnapError::JobFailed {
            operation,
            job: ArrayJobId(0),
            snapshot,
            status: JobStatus::Failed,
            reason,
        },
    }
}

/// Calls `submit` until it succeeds, fails non-transiently, or the retry
/// budget is spent.
pub async fn submit_with_retry<T, F, Fut>(
    retry: &RetryPolicy,
    operation: Operation,
    snapshot: Option<SnapshotId>,
    mut submit: F,
) -> SnapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ArrayError>>,
{
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match submit().await {
            Ok(out) => return Ok(out),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    %operation,
                    snapshot = ?snapshot,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Array call failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(array_error(operation, snapshot, err)),
        }
    }
}

/// Waits for a submitted job; kills it if `timeout` elapses first.
pub async fn await_job(
    job: &dyn JobHandle,
    operation: Operation,
    snapshot: Option<SnapshotId>,
    timeout: Duration,
) -> SnapResult<ArrayJobId> {
    let id = job.job_id();
    if !job.wait_for_completion(timeout).await {
        tracing::warn!(%operation, job = %id, snapshot = ?snapshot, "Array job timed out, killing");
        job.kill().await;
        return Err(SnapError::TimedOut {
            operation,
            snapshot,
            timeout,
        });
    }
    let status = job.status().await;
    if status != JobStatus::Completed {
        return Err(SnapError::JobFailed {
            operation,
            job: id,
            snapshot,
            status,
            reason: job.delay_reason().await,
        });
    }
    tracing::debug!(%operation, job = %id, snapshot = ?snapshot, "Array job completed");
    Ok(id)
}

/// Submits with retry and waits for completion, all within `timeout`.
pub async fn run_array_job<T, F, Fut>(
    retry: &RetryPolicy,
    operation: Operation,
    snapshot: Option<SnapshotId>,
    timeout: Duration,
    submit: F,
) -> SnapResult<T>
where
    T: Submitted,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ArrayError>>,
{
    let deadline = Instant::now() + timeout;
    let submitted = timeout_at(deadline, submit_with_retry(retry, operation, snapshot, submit))
        .await
        .map_err(|_| SnapError::TimedOut {
            operation,
            snapshot,
            timeout,
        })??;
    let remaining = deadline.saturating_duration_since(Instant::now());
    match await_job(submitted.job(), operation, snapshot, remaining).await {
        Ok(_) => Ok(submitted),
        Err(SnapError::TimedOut { .. }) => Err(SnapError::TimedOut {
            operation,
            snapshot,
            timeout,
        }),
        Err(e) => Err(e),
    }
}

/// Polls `check` up to `attempts` times, `interval` apart, until it reports
/// `true`. Read errors count as a negative read.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ArrayError>>,
{
    for attempt in 1..=attempts.max(1) {
        match check().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => tracing::debug!(attempt, error = %err, "Verification read failed"),
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    false
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_exponential_and_capped() {
        let retry = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = retry.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let second = retry.delay_for(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        let capped = retry.delay_for(8);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(375));
        assert_eq!(RetryPolicy::none().delay_for(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_budget_spent() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: SnapResult<u32> = submit_with_retry(
            &RetryPolicy::immediate(3),
            Operation::Mount,
            Some(SnapshotId(1)),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ArrayError::Communication("reset".into()))
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: SnapResult<u32> = submit_with_retry(
            &RetryPolicy::immediate(3),
            Operation::Delete,
            None,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ArrayError::Rejected("no such snapshot".into()))
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SnapError::JobFailed { .. })));
    }

    #[tokio::test]
    async fn poll_until_gives_up() {
        let counter = AtomicU32::new(0);
        let reads = &counter;
        let seen = poll_until(4, Duration::ZERO, move || async move {
            Ok(reads.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await;
        assert!(seen);
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        let never = poll_until(2, Duration::ZERO, || async { Ok(false) }).await;
        assert!(!never);
    }
}
