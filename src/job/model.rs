//! Job record and creation request.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::state::JobStatus;

/// Task name of composite jobs that fan out into subjobs.
pub const PIPELINE_TASK: &str = "pipeline";

/// One unit of submitted work with a tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Present only once the job is terminal.
    pub result: Option<Value>,
    pub parent_id: Option<Uuid>,
    /// Sibling that must reach `done` before this job is claimable.
    pub depends_on: Option<Uuid>,
    /// Step name -> child job id. Only pipeline jobs have entries.
    pub subjobs: BTreeMap<String, Uuid>,
    pub priority: i64,
    /// Number of failed executions so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub timeout_ms: Option<u64>,
    /// Earliest time the job may be claimed again (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Job {
    /// Whether this job is a pipeline parent.
    pub fn is_pipeline(&self) -> bool {
        self.task == PIPELINE_TASK
    }

    /// Move to a new status, stamping timestamps.
    ///
    /// Leaving a terminal-bound path (retry back to queued) clears the result
    /// and start time so the next claim starts clean.
    pub fn transition_to(&mut self, status: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(status) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        match status {
            JobStatus::Running => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Queued => {
                self.started_at = None;
                self.result = None;
            }
            JobStatus::Done | JobStatus::Error | JobStatus::Canceled => {
                self.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    /// Mark the job done with the handler's result.
    pub fn complete(&mut self, result: Value) -> Result<(), JobError> {
        self.transition_to(JobStatus::Done)?;
        self.result = Some(result);
        Ok(())
    }

    /// Mark the job failed with an error detail.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<(), JobError> {
        let detail = detail.into();
        self.transition_to(JobStatus::Error)?;
        self.result = Some(json!({
            "ok": false,
            "error": detail,
            "attempts": self.attempts,
        }));
        self.last_error = Some(detail);
        Ok(())
    }

    /// Mark the job canceled.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        let reason = reason.into();
        self.transition_to(JobStatus::Canceled)?;
        self.result = Some(json!({ "ok": false, "error": "canceled", "reason": reason }));
        Ok(())
    }

    /// When a running job must be finished by, if it carries a timeout.
    ///
    /// A timeout too large to represent as a date has no deadline.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let timeout = i64::try_from(self.timeout_ms?).ok()?;
        started.checked_add_signed(chrono::Duration::try_milliseconds(timeout)?)
    }

    /// Check if the job is running past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.deadline().is_some_and(|d| now >= d)
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task: String,
    pub payload: Value,
    pub parent_id: Option<Uuid>,
    pub depends_on: Option<Uuid>,
    pub priority: i64,
    pub timeout_ms: Option<u64>,
}

impl NewJob {
    pub fn new(task: impl Into<String>, payload: Value) -> Self {
        Self {
            task: task.into(),
            payload,
            parent_id: None,
            depends_on: None,
            priority: 0,
            timeout_ms: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_dependency(mut self, depends_on: Option<Uuid>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Build the initial `queued` record.
    pub fn into_job(self) -> Job {
        Job {
            id: Uuid::new_v4(),
            task: self.task,
            payload: self.payload,
            status: JobStatus::Queued,
            result: None,
            parent_id: self.parent_id,
            depends_on: self.depends_on,
            subjobs: BTreeMap::new(),
            priority: self.priority,
            attempts: 0,
            last_error: None,
            cancel_requested: false,
            timeout_ms: self.timeout_ms,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        }
    }
}
