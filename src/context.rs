//! Task context — what a handler knows about the job it is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

/// Shared cooperative-cancellation flag.
///
/// Cloned into the handler's context; raised by the dispatcher or watchdog.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context for a running job.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Job being executed.
    pub job_id: Uuid,
    /// Failed executions before this one.
    pub attempt: u32,
    /// Pipeline parent, when running as a step.
    pub parent_id: Option<Uuid>,
    /// Result of the step this one waited for.
    pub upstream: Option<Value>,
    cancel: CancelFlag,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

impl TaskContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            attempt: 0,
            parent_id: None,
            upstream: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_upstream(mut self, upstream: Option<Value>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_raised()
    }

    /// Bail out with `TaskError::Canceled` if cancellation was requested.
    ///
    /// Handlers call this between units of work.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_canceled() {
            Err(TaskError::Canceled)
        } else {
            Ok(())
        }
    }
}
