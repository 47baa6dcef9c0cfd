//! Retry policy applied when a handler fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::store::{self, JobStore};

/// Maximum extra delay as a fraction of the computed backoff.
const MAX_JITTER: f64 = 0.25;

/// Decides between re-enqueue with backoff and terminal failure.
pub struct RetryManager {
    store: Arc<dyn JobStore>,
    config: Arc<OrchestratorConfig>,
}

impl RetryManager {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<OrchestratorConfig>) -> Self {
        Self { store, config }
    }

    /// Backoff before the next attempt, without jitter.
    ///
    /// `base * 2^(attempts-1)`, capped at the configured maximum.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.config.retry_base.saturating_mul(1u32 << exponent);
        delay.min(self.config.retry_max_delay)
    }

    /// Record a handler failure on a job this worker holds.
    ///
    /// Increments `attempts`; requeues with a stored `not_before` while the
    /// task's retry budget lasts, otherwise fails the job terminally. A job
    /// with a pending cancellation is canceled instead of requeued.
    pub async fn on_failure(&self, job: &Job, detail: &str) -> Result<Job, JobError> {
        let max_retries = self.config.policy_for(&job.task).max_retries;
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);

        let updated = store::modify(self.store.as_ref(), job.id, |j| {
            if j.status != JobStatus::Running {
                return Err(JobError::InvalidTransition {
                    id: j.id,
                    from: j.status,
                    to: JobStatus::Error,
                });
            }

            j.attempts += 1;
            j.last_error = Some(detail.to_string());

            if j.cancel_requested {
                j.cancel("canceled after failure")
            } else if j.attempts <= max_retries {
                let delay = self.backoff_delay(j.attempts).mul_f64(1.0 + jitter);
                j.transition_to(JobStatus::Queued)?;
                j.not_before = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                Ok(())
            } else {
                j.fail(detail)
            }
        })
        .await?;

        match updated.status {
            JobStatus::Queued => info!(
                job_id = %updated.id,
                task = %updated.task,
                attempts = updated.attempts,
                not_before = ?updated.not_before,
                error = %detail,
                "Job failed, retry scheduled"
            ),
            JobStatus::Error => warn!(
                job_id = %updated.id,
                task = %updated.task,
                attempts = updated.attempts,
                error = %detail,
                "Job failed, retries exhausted"
            ),
            _ => info!(job_id = %updated.id, "Job canceled after failure"),
        }
        Ok(updated)
    }
}
