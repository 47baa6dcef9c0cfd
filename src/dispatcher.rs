//! Admission control and the caller-facing job operations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::JobError;
use crate::job::{Job, JobStatus, NewJob, PIPELINE_TASK};
use crate::pipeline::PipelineSpec;
use crate::store::JobStore;
use crate::tasks::TaskRegistry;
use crate::waiter::ResultWaiter;
use crate::worker::{CancelRegistry, request_cancel};

/// A submission with the optional knobs the HTTP surface exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task: String,
    pub payload: Value,
    pub priority: i64,
    /// Overrides the task policy's timeout. `Some(0)` disables it.
    pub timeout_secs: Option<u64>,
}

impl Submission {
    pub fn new(task: impl Into<String>, payload: Value) -> Self {
        Self {
            task: task.into(),
            payload,
            priority: 0,
            timeout_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// A job plus, when asked for, snapshots of its subjobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjobs_detail: Option<BTreeMap<String, Job>>,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    cancels: Arc<CancelRegistry>,
    waiter: ResultWaiter,
    config: Arc<OrchestratorConfig>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        cancels: Arc<CancelRegistry>,
        waiter: ResultWaiter,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            cancels,
            waiter,
            config,
        }
    }

    /// Submit a task with default options and return its id.
    pub async fn submit(&self, task: &str, payload: Value) -> Result<Uuid, JobError> {
        Ok(self.submit_with(Submission::new(task, payload)).await?.id)
    }

    /// Validate, admit and enqueue a submission.
    pub async fn submit_with(&self, submission: Submission) -> Result<Job, JobError> {
        let task = submission.task.trim().to_lowercase();
        if task.is_empty() {
            return Err(JobError::Validation("task must be a non-empty string".into()));
        }
        if !self.registry.is_known(&task) {
            return Err(JobError::UnknownTask { name: task });
        }

        let payload = match submission.payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(obj) => Value::Object(obj),
            _ => return Err(JobError::Validation("payload must be an object".into())),
        };
        if task == PIPELINE_TASK {
            PipelineSpec::parse(&payload, &self.registry)?;
        }

        let timeout = match submission.timeout_secs {
            Some(0) => None,
            Some(secs) if secs > self.config.max_timeout.as_secs() => {
                return Err(JobError::Validation(format!(
                    "timeout_secs must be at most {}",
                    self.config.max_timeout.as_secs()
                )));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.policy_for(&task).timeout,
        };

        let queued = self.store.count_by_status(JobStatus::Queued).await?;
        if queued >= self.config.max_queued {
            warn!(
                task = %task,
                queued,
                limit = self.config.max_queued,
                "Submission rejected, queue full"
            );
            return Err(JobError::QueueFull {
                queued,
                limit: self.config.max_queued,
            });
        }

        let job = self
            .store
            .create(
                NewJob::new(task, payload)
                    .with_priority(submission.priority)
                    .with_timeout(timeout),
            )
            .await?;
        info!(job_id = %job.id, task = %job.task, priority = job.priority, "Job submitted");
        Ok(job)
    }

    /// Cancel a job. Terminal jobs come back unchanged.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, JobError> {
        request_cancel(self.store.as_ref(), &self.cancels, id, "canceled by request").await
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        self.store.get(id).await
    }

    /// Read a job, optionally long-polling up to `follow` and expanding subjobs.
    pub async fn view(
        &self,
        id: Uuid,
        expand: bool,
        follow: Duration,
    ) -> Result<JobView, JobError> {
        let follow = follow.min(self.config.max_follow);
        let job = self.waiter.wait_for(id, follow).await?;

        let subjobs_detail = if expand && !job.subjobs.is_empty() {
            let mut detail = BTreeMap::new();
            for (name, child_id) in &job.subjobs {
                match self.store.get(*child_id).await {
                    Ok(child) => {
                        detail.insert(name.clone(), child);
                    }
                    Err(JobError::NotFound { .. }) => {
                        warn!(job_id = %id, child_id = %child_id, "Subjob record missing");
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(detail)
        } else {
            None
        };

        Ok(JobView {
            job,
            subjobs_detail,
        })
    }

    /// Most recent jobs first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        self.store.list_recent(limit).await
    }

    /// Store reachability, for readiness probes.
    pub async fn ping(&self) -> Result<(), JobError> {
        self.store.ping().await
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Longest long-poll a caller may request.
    pub fn max_follow(&self) -> Duration {
        self.config.max_follow
    }
}
