//! Long-poll support: wait for a job to finish, bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::events::JobEventBus;
use crate::job::Job;
use crate::store::JobStore;

/// Blocks callers until a job is terminal or their wait budget runs out.
#[derive(Clone)]
pub struct ResultWaiter {
    store: Arc<dyn JobStore>,
    events: Arc<JobEventBus>,
}

impl ResultWaiter {
    pub fn new(store: Arc<dyn JobStore>, events: Arc<JobEventBus>) -> Self {
        Self { store, events }
    }

    /// Return the job once terminal, or its latest snapshot after `max_wait`.
    ///
    /// A zero `max_wait` is a single read. Running out of time is not an
    /// error; the caller gets whatever status the job has.
    pub async fn wait_for(&self, id: Uuid, max_wait: Duration) -> Result<Job, JobError> {
        // Subscribe first so a change between the read and the wait is not lost.
        let mut rx = self.events.subscribe();
        let job = self.store.get(id).await?;
        if job.status.is_terminal() || max_wait.is_zero() {
            return Ok(job);
        }

        let deadline = Instant::now() + max_wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_elapsed) => {
                    debug!(job_id = %id, "Wait deadline reached");
                    return self.store.get(id).await;
                }
                Ok(Ok(event)) if event.id == id => {
                    if event.status.is_terminal() {
                        return self.store.get(id).await;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(job_id = %id, skipped, "Waiter lagged behind job events");
                    let job = self.store.get(id).await?;
                    if job.status.is_terminal() {
                        return Ok(job);
                    }
                }
                Ok(Err(RecvError::Closed)) => return self.store.get(id).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob};
    use crate::store::{LibSqlBackend, NotifyingStore};
    use serde_json::json;

    async fn setup() -> (Arc<dyn JobStore>, ResultWaiter) {
        let events = JobEventBus::new();
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(NotifyingStore::new(Arc::new(backend), Arc::clone(&events)));
        let waiter = ResultWaiter::new(Arc::clone(&store), events);
        (store, waiter)
    }

    fn finish_after(store: Arc<dyn JobStore>, id: Uuid, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job = store.get(id).await.unwrap();
            store
                .update(id, job.version, &|j: &mut Job| j.complete(json!({"ok": true})))
                .await
                .unwrap();
        });
    }

    #[tokio::test]
    async fn returns_promptly_when_job_finishes() {
        let (store, waiter) = setup().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        store.claim_next().await.unwrap();
        finish_after(Arc::clone(&store), job.id, Duration::from_millis(500));

        let started = std::time::Instant::now();
        let result = waiter.wait_for(job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, JobStatus::Done);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn returns_running_snapshot_on_timeout() {
        let (store, waiter) = setup().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        store.claim_next().await.unwrap();

        let started = std::time::Instant::now();
        let result = waiter.wait_for(job.id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.status, JobStatus::Running);
        assert!(result.result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn zero_wait_is_a_plain_read() {
        let (store, waiter) = setup().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            waiter.wait_for(job.id, Duration::ZERO),
        )
        .await
        .expect("zero wait must not block")
        .unwrap();
        assert_eq!(result.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn non_terminal_change_keeps_waiting() {
        let (store, waiter) = setup().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();

        let claimer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            claimer.claim_next().await.unwrap();
        });
        finish_after(Arc::clone(&store), job.id, Duration::from_millis(300));

        let result = waiter.wait_for(job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn many_waiters_wake_on_one_change() {
        let (store, waiter) = setup().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        store.claim_next().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let waiter = waiter.clone();
            handles.push(tokio::spawn(async move {
                waiter.wait_for(job.id, Duration::from_secs(2)).await.unwrap()
            }));
        }
        finish_after(Arc::clone(&store), job.id, Duration::from_millis(100));

        for handle in handles {
            assert_eq!(handle.await.unwrap().status, JobStatus::Done);
        }
    }

    #[tokio::test]
    async fn lagged_waiter_still_sees_completion() {
        let events = JobEventBus::with_capacity(1);
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(NotifyingStore::new(Arc::new(backend), Arc::clone(&events)));
        let waiter = ResultWaiter::new(Arc::clone(&store), Arc::clone(&events));
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        store.claim_next().await.unwrap();

        let noisy = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for _ in 0..8 {
                noisy.create(NewJob::new("report", json!({}))).await.unwrap();
            }
            let current = noisy.get(job.id).await.unwrap();
            noisy
                .update(job.id, current.version, &|j: &mut Job| j.complete(json!({"ok": true})))
                .await
                .unwrap();
        });

        let result = waiter.wait_for(job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (_store, waiter) = setup().await;
        let err = waiter
            .wait_for(Uuid::new_v4(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }
}
