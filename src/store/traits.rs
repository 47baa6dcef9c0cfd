//! `JobStore` trait — the single async interface for job persistence.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, JobStatus, NewJob};

/// In-place change applied by `JobStore::update`.
///
/// `Fn` rather than `FnOnce` so conflict retries can re-apply it to a fresh read.
pub type JobMutator<'a> = &'a (dyn Fn(&mut Job) -> Result<(), JobError> + Send + Sync);

/// Backend-agnostic job store.
///
/// Claim and update are the only operations that need atomicity; every
/// successful mutation bumps `version` by one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `queued` job.
    async fn create(&self, new: NewJob) -> Result<Job, JobError>;

    /// Atomically move the best claimable job to `running`.
    ///
    /// Never returns the same job to two callers. `None` when nothing is
    /// claimable right now; never blocks waiting for work.
    async fn claim_next(&self) -> Result<Option<Job>, JobError>;

    /// Apply `mutator` if the stored version still equals `expected_version`.
    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutator: JobMutator<'_>,
    ) -> Result<Job, JobError>;

    /// Fetch one job.
    async fn get(&self, id: Uuid) -> Result<Job, JobError>;

    /// Most recently created jobs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobError>;

    /// All jobs in a status, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobError>;

    /// Children of a pipeline job, in creation order.
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, JobError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobError>;

    /// Cheap round trip used by readiness checks.
    async fn ping(&self) -> Result<(), JobError>;
}

/// Validate and normalize a mutated copy against the stored record.
///
/// Backends call this between running the mutator and writing the row so
/// every implementation enforces the same lifecycle rules.
pub fn check_mutation(before: &Job, after: &mut Job) -> Result<(), JobError> {
    // Identity and submission fields never change after create.
    after.id = before.id;
    after.task.clone_from(&before.task);
    after.payload.clone_from(&before.payload);
    after.parent_id = before.parent_id;
    after.depends_on = before.depends_on;
    after.priority = before.priority;
    after.created_at = before.created_at;
    after.version = before.version;

    if after.status != before.status && !before.status.can_transition_to(after.status) {
        return Err(JobError::InvalidTransition {
            id: before.id,
            from: before.status,
            to: after.status,
        });
    }

    if !before.subjobs.is_empty() && after.subjobs != before.subjobs {
        return Err(JobError::Validation(format!(
            "subjobs of job {} are fixed once written",
            before.id
        )));
    }
    if !after.subjobs.is_empty() && !after.is_pipeline() {
        return Err(JobError::Validation(format!(
            "job {} is not a pipeline and cannot own subjobs",
            before.id
        )));
    }

    if after.status.is_terminal() {
        if after.finished_at.is_none() {
            after.finished_at = Some(Utc::now());
        }
    } else {
        after.result = None;
        after.finished_at = None;
    }
    if after.status == JobStatus::Running && after.started_at.is_none() {
        after.started_at = Some(Utc::now());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn queued(task: &str) -> Job {
        NewJob::new(task, json!({"a": 1})).into_job()
    }

    #[test]
    fn immutable_fields_are_restored() {
        let before = queued("plan");
        let mut after = before.clone();
        after.id = Uuid::new_v4();
        after.task = "report".into();
        after.payload = json!({});
        after.priority = 9;

        check_mutation(&before, &mut after).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.task, "plan");
        assert_eq!(after.payload, json!({"a": 1}));
        assert_eq!(after.priority, 0);
    }

    #[test]
    fn rejects_illegal_edge() {
        let before = queued("plan");
        let mut after = before.clone();
        after.status = JobStatus::Done;

        let err = check_mutation(&before, &mut after).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn result_only_in_terminal_states() {
        let before = queued("plan");
        let mut after = before.clone();
        after.result = Some(json!({"early": true}));

        check_mutation(&before, &mut after).unwrap();
        assert!(after.result.is_none());
    }

    #[test]
    fn terminal_entry_stamps_finished_at() {
        let mut before = queued("plan");
        before.status = JobStatus::Running;
        let mut after = before.clone();
        after.status = JobStatus::Error;

        check_mutation(&before, &mut after).unwrap();
        assert!(after.finished_at.is_some());
    }

    #[test]
    fn subjobs_fixed_after_expansion() {
        let mut before = queued(crate::job::PIPELINE_TASK);
        before.subjobs.insert("plan".into(), Uuid::new_v4());
        let mut after = before.clone();
        after.subjobs.insert("extra".into(), Uuid::new_v4());

        assert!(check_mutation(&before, &mut after).is_err());
    }

    #[test]
    fn subjobs_only_on_pipelines() {
        let before = queued("plan");
        let mut after = before.clone();
        after.subjobs.insert("x".into(), Uuid::new_v4());

        assert!(check_mutation(&before, &mut after).unwrap_err().is_validation());
    }
}
