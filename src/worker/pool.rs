//! Worker pool — fixed set of executors that claim and run jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::context::TaskContext;
use crate::error::{JobError, TaskError};
use crate::events::JobEventBus;
use crate::job::{Job, JobStatus};
use crate::pipeline::PipelineExpander;
use crate::store::{self, JobStore};
use crate::tasks::TaskRegistry;
use crate::worker::cancel::CancelRegistry;
use crate::worker::retry::RetryManager;

/// How one execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Handler returned a result.
    Done(Value),
    /// Handler failed; the retry policy decides what happens next.
    Failed(String),
    /// The job can never succeed as submitted; no retry.
    Rejected(String),
    /// Handler stopped at a cancellation checkpoint.
    Canceled,
    /// Handler overran its deadline and was abandoned.
    TimedOut,
}

impl From<Result<Value, TaskError>> for Outcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Outcome::Done(value),
            Err(TaskError::Failed(detail)) => Outcome::Failed(detail),
            Err(TaskError::InvalidPayload(detail)) => {
                Outcome::Rejected(format!("invalid payload: {detail}"))
            }
            Err(TaskError::Canceled) => Outcome::Canceled,
        }
    }
}

/// Everything an executor needs.
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<TaskRegistry>,
    pub events: Arc<JobEventBus>,
    pub cancels: Arc<CancelRegistry>,
    pub retry: Arc<RetryManager>,
    pub expander: Arc<PipelineExpander>,
    pub config: Arc<OrchestratorConfig>,
}

#[derive(Clone)]
pub struct WorkerPool {
    deps: Arc<WorkerDeps>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl WorkerPool {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    /// Start `config.workers` executors. They stop when `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.deps.config.workers)
            .map(|index| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(index, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = index, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = self.deps.events.work_available() => {}
                        _ = tokio::time::sleep(self.deps.config.idle_backoff) => {}
                    }
                }
                Err(e) => {
                    error!(worker = index, error = %e, "Claim failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.deps.config.idle_backoff) => {}
                    }
                }
            }
        }
        debug!(worker = index, "Worker stopped");
    }

    /// Claim and fully process one job. `false` when nothing was claimable.
    pub async fn run_once(&self) -> Result<bool, JobError> {
        let Some(job) = self.deps.store.claim_next().await? else {
            return Ok(false);
        };
        info!(job_id = %job.id, task = %job.task, attempt = job.attempts + 1, "Job claimed");

        if job.is_pipeline() {
            self.park_pipeline(&job).await;
        } else {
            let outcome = self.execute(&job).await;
            self.finish(&job, outcome).await;
        }
        Ok(true)
    }

    /// Hand jobs left running by a previous process back to the retry path.
    ///
    /// Pipelines that never got their mapping are expanded again; expanded
    /// ones are left for the reconciler.
    pub async fn recover(&self) -> Result<usize, JobError> {
        let running = self.deps.store.list_by_status(JobStatus::Running).await?;
        let mut recovered = 0;

        for job in running {
            if job.is_pipeline() {
                if job.subjobs.is_empty() {
                    self.park_pipeline(&job).await;
                    recovered += 1;
                }
                continue;
            }
            match self.deps.retry.on_failure(&job, "worker restarted").await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to recover stale job"),
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered jobs from a previous run");
        }
        Ok(recovered)
    }

    async fn park_pipeline(&self, job: &Job) {
        match self.deps.expander.expand(job).await {
            Ok(parent) => debug!(job_id = %parent.id, "Pipeline parked until steps finish"),
            Err(JobError::InvalidTransition { from, .. }) => {
                debug!(job_id = %job.id, status = %from, "Pipeline stopped during expansion");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Pipeline expansion failed");
                self.finish(job, Outcome::Rejected(e.to_string())).await;
            }
        }
    }

    async fn execute(&self, job: &Job) -> Outcome {
        let Some(handler) = self.deps.registry.get(&job.task) else {
            return Outcome::Rejected(format!("unknown task: {}", job.task));
        };

        let upstream = match job.depends_on {
            Some(dep) => match self.deps.store.get(dep).await {
                Ok(dep) => dep.result,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not load upstream result");
                    return Outcome::Failed(format!("could not load upstream result: {e}"));
                }
            },
            None => None,
        };

        let cancel = self.deps.cancels.register(job.id).await;
        if job.cancel_requested {
            cancel.raise();
        }

        let ctx = TaskContext::new(job.id)
            .with_attempt(job.attempts)
            .with_parent(job.parent_id)
            .with_upstream(upstream)
            .with_cancel(cancel);

        let run = AssertUnwindSafe(handler.execute(job.payload.clone(), &ctx)).catch_unwind();
        let remaining = job
            .deadline()
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or_default());

        let outcome = match remaining {
            Some(budget) => match tokio::time::timeout(budget, run).await {
                Ok(finished) => finished,
                Err(_) => {
                    self.deps.cancels.remove(job.id).await;
                    return Outcome::TimedOut;
                }
            },
            None => run.await,
        };
        self.deps.cancels.remove(job.id).await;

        match outcome {
            Ok(result) => Outcome::from(result),
            Err(panic) => Outcome::Failed(format!("handler panicked: {}", panic_message(panic))),
        }
    }

    /// Persist the outcome. Losing to the watchdog or a cancel is logged, not an error.
    async fn finish(&self, job: &Job, outcome: Outcome) {
        let store = self.deps.store.as_ref();
        let result = match &outcome {
            Outcome::Done(value) => {
                store::modify(store, job.id, |j| j.complete(value.clone())).await
            }
            Outcome::Failed(detail) => self.deps.retry.on_failure(job, detail).await,
            Outcome::Rejected(detail) => {
                store::modify(store, job.id, |j| j.fail(detail.as_str())).await
            }
            Outcome::Canceled => {
                store::modify(store, job.id, |j| j.cancel("canceled at checkpoint")).await
            }
            Outcome::TimedOut => store::modify(store, job.id, |j| j.fail("timeout")).await,
        };

        match result {
            Ok(updated) => info!(
                job_id = %updated.id,
                task = %updated.task,
                status = %updated.status,
                "Job finished"
            ),
            Err(JobError::InvalidTransition { from, .. }) => warn!(
                job_id = %job.id,
                status = %from,
                "Result discarded, job already settled"
            ),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to persist job outcome"),
        }
    }
}
