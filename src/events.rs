//! Job event bus — broadcast fan-out of job changes.
//!
//! Every persisted mutation publishes one `JobEvent`. Waiters, the pipeline
//! reconciler and anything else interested subscribe independently. Idle
//! workers are woken through a separate `Notify` when new work may be
//! claimable.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tracing::trace;
use uuid::Uuid;

use crate::job::{Job, JobStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A job changed state or content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub task: String,
    pub status: JobStatus,
    pub version: i64,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            parent_id: job.parent_id,
            task: job.task.clone(),
            status: job.status,
            version: job.version,
        }
    }
}

/// Broadcast channel for job events plus the worker wake-up signal.
pub struct JobEventBus {
    tx: broadcast::Sender<JobEvent>,
    work: Notify,
}

impl JobEventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            work: Notify::new(),
        })
    }

    /// Subscribe to all subsequent job events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Ok if no receivers are listening.
    pub fn publish(&self, event: JobEvent) {
        trace!(job_id = %event.id, status = %event.status, version = event.version, "Job event");
        let _ = self.tx.send(event);
    }

    /// Wake idle workers; new work may be claimable.
    pub fn notify_work(&self) {
        self.work.notify_waiters();
    }

    /// Resolves on the next `notify_work` call.
    pub async fn work_available(&self) {
        self.work.notified().await;
    }
}
