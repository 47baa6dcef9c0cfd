//! Watchdog — enforces deadlines on running jobs.
//!
//! Each scan:
//! 1. Fails running jobs past their deadline with `timeout` and raises their cancel flag
//! 2. Copies durable `cancel_requested` flags onto in-process handlers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::job::JobStatus;
use crate::store::{self, JobStore};
use crate::worker::cancel::CancelRegistry;

pub struct Watchdog {
    store: Arc<dyn JobStore>,
    cancels: Arc<CancelRegistry>,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, cancels: Arc<CancelRegistry>) -> Self {
        Self { store, cancels }
    }

    /// One pass over running jobs. Returns how many timed out.
    pub async fn scan(&self) -> Result<usize, JobError> {
        let now = Utc::now();
        let mut timed_out = 0;

        for job in self.store.list_by_status(JobStatus::Running).await? {
            if job.is_overdue(now) {
                self.cancels.raise(job.id).await;
                let outcome = store::modify(self.store.as_ref(), job.id, |j| {
                    if j.status != JobStatus::Running {
                        return Err(JobError::InvalidTransition {
                            id: j.id,
                            from: j.status,
                            to: JobStatus::Error,
                        });
                    }
                    j.cancel_requested = true;
                    j.fail("timeout")
                })
                .await;

                match outcome {
                    Ok(_) => {
                        timed_out += 1;
                        warn!(
                            job_id = %job.id,
                            task = %job.task,
                            timeout_ms = ?job.timeout_ms,
                            "Job timed out"
                        );
                    }
                    Err(JobError::InvalidTransition { from, .. }) => {
                        debug!(
                            job_id = %job.id,
                            status = %from,
                            "Job finished before timeout landed"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else if job.cancel_requested && self.cancels.raise(job.id).await {
                debug!(job_id = %job.id, "Propagated cancel request to handler");
            }
        }
        Ok(timed_out)
    }

    /// Spawn the periodic scan loop.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Watchdog started (interval: {}ms)", interval.as_millis());
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        if let Err(e) = self.scan().await {
                            warn!(error = %e, "Watchdog scan failed");
                        }
                    }
                }
            }
            debug!("Watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, NewJob};
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn running(store: &Arc<dyn JobStore>, timeout: Option<Duration>) -> Job {
        store
            .create(NewJob::new("execute", json!({})).with_timeout(timeout))
            .await
            .unwrap();
        store.claim_next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn overdue_job_fails_with_timeout() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cancels = Arc::new(CancelRegistry::new());
        let job = running(&store, Some(Duration::from_millis(10))).await;
        let flag = cancels.register(job.id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let watchdog = Watchdog::new(Arc::clone(&store), cancels);
        assert_eq!(watchdog.scan().await.unwrap(), 1);

        let job = store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.result.unwrap()["error"], "timeout");
        assert!(flag.is_raised());
    }

    #[tokio::test]
    async fn jobs_without_deadline_are_left_alone() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let job = running(&store, None).await;

        let watchdog = Watchdog::new(Arc::clone(&store), Arc::new(CancelRegistry::new()));
        assert_eq!(watchdog.scan().await.unwrap(), 0);
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn far_future_timeout_does_not_break_scan() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let huge = running(&store, Some(Duration::from_secs(1_000_000_000_000_000))).await;
        let short = running(&store, Some(Duration::from_millis(10))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let watchdog = Watchdog::new(Arc::clone(&store), Arc::new(CancelRegistry::new()));
        assert_eq!(watchdog.scan().await.unwrap(), 1);
        assert_eq!(store.get(huge.id).await.unwrap().status, JobStatus::Running);
        assert_eq!(store.get(short.id).await.unwrap().status, JobStatus::Error);
    }

    #[tokio::test]
    async fn durable_cancel_flag_reaches_handler() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cancels = Arc::new(CancelRegistry::new());
        let job = running(&store, None).await;
        let flag = cancels.register(job.id).await;
        store
            .update(job.id, job.version, &|j: &mut Job| {
                j.cancel_requested = true;
                Ok(())
            })
            .await
            .unwrap();

        Watchdog::new(Arc::clone(&store), cancels).scan().await.unwrap();
        assert!(flag.is_raised());
    }
}
