//! Cooperative cancellation.
//!
//! The durable `cancel_requested` flag lives on the job record; the
//! in-process `CancelFlag` a running handler polls lives here.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::CancelFlag;
use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::store::{self, JobStore};

/// Cancel flags of jobs currently executing in this process.
#[derive(Default)]
pub struct CancelRegistry {
    flags: RwLock<HashMap<Uuid, CancelFlag>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the flag for a job about to run.
    pub async fn register(&self, id: Uuid) -> CancelFlag {
        let flag = CancelFlag::new();
        self.flags.write().await.insert(id, flag.clone());
        flag
    }

    pub async fn remove(&self, id: Uuid) {
        self.flags.write().await.remove(&id);
    }

    /// Raise the flag if the job runs here. Returns whether it did.
    pub async fn raise(&self, id: Uuid) -> bool {
        match self.flags.read().await.get(&id) {
            Some(flag) => {
                flag.raise();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.flags.read().await.len()
    }
}

/// Cancel one job without touching its children.
///
/// Queued jobs and parked pipeline parents are canceled at once. Running
/// jobs get the durable flag plus the in-process flag; the handler stops at
/// its next checkpoint. Terminal jobs are returned untouched.
pub async fn cancel_job(
    store: &dyn JobStore,
    cancels: &CancelRegistry,
    id: Uuid,
    reason: &str,
) -> Result<Job, JobError> {
    let job = store.get(id).await?;
    if job.status.is_terminal() {
        return Ok(job);
    }

    let updated = store::modify(store, id, |j| match j.status {
        JobStatus::Queued => j.cancel(reason),
        JobStatus::Running if j.is_pipeline() => j.cancel(reason),
        JobStatus::Running => {
            j.cancel_requested = true;
            Ok(())
        }
        _ => Ok(()),
    })
    .await?;

    if updated.status == JobStatus::Running {
        let local = cancels.raise(id).await;
        debug!(job_id = %id, local, "Cancellation requested for running job");
    } else {
        info!(job_id = %id, task = %updated.task, reason, "Job canceled");
    }
    Ok(updated)
}

/// Cancel a job and, for pipelines, every unfinished child.
pub async fn request_cancel(
    store: &dyn JobStore,
    cancels: &CancelRegistry,
    id: Uuid,
    reason: &str,
) -> Result<Job, JobError> {
    let job = cancel_job(store, cancels, id, reason).await?;
    if job.is_pipeline() && job.status.is_terminal() {
        cancel_children(store, cancels, id, reason).await?;
    }
    Ok(job)
}

/// Cancel every non-terminal child of a pipeline.
pub async fn cancel_children(
    store: &dyn JobStore,
    cancels: &CancelRegistry,
    parent_id: Uuid,
    reason: &str,
) -> Result<usize, JobError> {
    let mut canceled = 0;
    for child in store.list_children(parent_id).await? {
        if child.status.is_active() {
            cancel_job(store, cancels, child.id, reason).await?;
            canceled += 1;
        }
    }
    Ok(canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    #[tokio::test]
    async fn registry_tracks_running_handlers() {
        let cancels = CancelRegistry::new();
        let id = Uuid::new_v4();
        let flag = cancels.register(id).await;
        assert_eq!(cancels.len().await, 1);

        assert!(cancels.raise(id).await);
        assert!(flag.is_raised());

        cancels.remove(id).await;
        assert_eq!(cancels.len().await, 0);
        assert!(!cancels.raise(id).await);
    }

    #[tokio::test]
    async fn queued_job_is_canceled_immediately() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let cancels = CancelRegistry::new();
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();

        let canceled = request_cancel(&store, &cancels, job.id, "user").await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.result.unwrap()["error"], "canceled");
    }

    #[tokio::test]
    async fn running_job_gets_flags() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let cancels = CancelRegistry::new();
        store.create(NewJob::new("execute", json!({}))).await.unwrap();
        let job = store.claim_next().await.unwrap().unwrap();
        let flag = cancels.register(job.id).await;

        let updated = request_cancel(&store, &cancels, job.id, "user").await.unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert!(updated.cancel_requested);
        assert!(flag.is_raised());
    }

    #[tokio::test]
    async fn terminal_job_is_untouched() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let cancels = CancelRegistry::new();
        store.create(NewJob::new("plan", json!({}))).await.unwrap();
        let job = store.claim_next().await.unwrap().unwrap();
        let done = store
            .update(job.id, job.version, &|j: &mut Job| j.complete(json!({"ok": true})))
            .await
            .unwrap();

        let after = request_cancel(&store, &cancels, job.id, "late").await.unwrap();
        assert_eq!(after.status, JobStatus::Done);
        assert_eq!(after.version, done.version);
    }

    #[tokio::test]
    async fn pipeline_cancel_cascades() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let cancels = CancelRegistry::new();
        store
            .create(NewJob::new(crate::job::PIPELINE_TASK, json!({"steps": ["plan"]})))
            .await
            .unwrap();
        let parent = store.claim_next().await.unwrap().unwrap();
        let child = store
            .create(NewJob::new("plan", json!({})).with_parent(parent.id))
            .await
            .unwrap();

        let canceled = request_cancel(&store, &cancels, parent.id, "user").await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(store.get(child.id).await.unwrap().status, JobStatus::Canceled);
    }
}
