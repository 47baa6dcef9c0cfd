//! Store decorator that publishes a `JobEvent` for every successful mutation.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::{JobEvent, JobEventBus};
use crate::job::{Job, JobStatus, NewJob};
use crate::store::traits::{JobMutator, JobStore};

/// Wraps any `JobStore`, fanning changes out on a `JobEventBus`.
///
/// Events are published after the write succeeded, so a subscriber that
/// re-reads the store on an event always sees at least that version.
pub struct NotifyingStore {
    inner: Arc<dyn JobStore>,
    events: Arc<JobEventBus>,
}

impl NotifyingStore {
    pub fn new(inner: Arc<dyn JobStore>, events: Arc<JobEventBus>) -> Self {
        Self { inner, events }
    }

    pub fn events(&self) -> &Arc<JobEventBus> {
        &self.events
    }

    fn publish(&self, job: &Job) {
        self.events.publish(JobEvent::from(job));
        // Queued jobs, finished dependencies and freshly expanded pipelines
        // can all make something claimable.
        let unblocks = matches!(job.status, JobStatus::Queued | JobStatus::Done)
            || (job.is_pipeline() && !job.subjobs.is_empty());
        if unblocks {
            self.events.notify_work();
        }
    }
}

#[async_trait]
impl JobStore for NotifyingStore {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let job = self.inner.create(new).await?;
        self.publish(&job);
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobError> {
        let claimed = self.inner.claim_next().await?;
        if let Some(job) = &claimed {
            self.publish(job);
        }
        Ok(claimed)
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutator: JobMutator<'_>,
    ) -> Result<Job, JobError> {
        let job = self.inner.update(id, expected_version, mutator).await?;
        self.publish(&job);
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        self.inner.get(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        self.inner.list_recent(limit).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobError> {
        self.inner.list_by_status(status).await
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, JobError> {
        self.inner.list_children(parent_id).await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobError> {
        self.inner.count_by_status(status).await
    }

    async fn ping(&self) -> Result<(), JobError> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn store() -> NotifyingStore {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        NotifyingStore::new(Arc::new(backend), JobEventBus::new())
    }

    #[tokio::test]
    async fn every_mutation_publishes_one_event() {
        let store = store().await;
        let mut rx = store.events().subscribe();

        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        store
            .update(claimed.id, claimed.version, &|j: &mut Job| j.complete(json!({"ok": true})))
            .await
            .unwrap();

        let statuses: Vec<(JobStatus, i64)> = (0..3)
            .map(|_| rx.try_recv().map(|e| (e.status, e.version)).unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                (JobStatus::Queued, 0),
                (JobStatus::Running, 1),
                (JobStatus::Done, 2)
            ]
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get(job.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn failed_update_publishes_nothing() {
        let store = store().await;
        let job = store.create(NewJob::new("plan", json!({}))).await.unwrap();
        let mut rx = store.events().subscribe();

        let err = store
            .update(job.id, 7, &|j: &mut Job| j.cancel("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_claim_publishes_nothing() {
        let store = store().await;
        let mut rx = store.events().subscribe();
        assert!(store.claim_next().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }
}
