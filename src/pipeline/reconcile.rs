//! Promotes parked pipeline parents once their children settle.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, SubjobFailurePolicy};
use crate::error::JobError;
use crate::events::{JobEvent, JobEventBus};
use crate::job::{Job, JobStatus, PIPELINE_TASK};
use crate::store::{self, JobStore};
use crate::worker::cancel::{CancelRegistry, cancel_children, cancel_job};

/// Aggregates child outcomes into the parent's final status.
pub struct PipelineReconciler {
    store: Arc<dyn JobStore>,
    cancels: Arc<CancelRegistry>,
    config: Arc<OrchestratorConfig>,
}

fn failed(status: JobStatus) -> bool {
    matches!(status, JobStatus::Error | JobStatus::Canceled)
}

/// `{"ok", "subjobs": {name: {status, result}}, "failed"?}`
fn report(subjobs: &BTreeMap<String, Uuid>, children: &[Job]) -> (bool, Value) {
    let mut steps = serde_json::Map::new();
    let mut failed_steps = Vec::new();
    for (name, id) in subjobs {
        let child = children.iter().find(|c| c.id == *id);
        let status = child.map(|c| c.status);
        if status.is_none_or(failed) {
            failed_steps.push(name.clone());
        }
        steps.insert(
            name.clone(),
            json!({
                "status": status,
                "result": child.and_then(|c| c.result.clone()),
            }),
        );
    }

    let ok = failed_steps.is_empty();
    let mut value = json!({ "ok": ok, "subjobs": steps });
    if !ok {
        value["failed"] = json!(failed_steps);
    }
    (ok, value)
}

impl PipelineReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        cancels: Arc<CancelRegistry>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            cancels,
            config,
        }
    }

    /// Re-evaluate one pipeline. Returns the parent if it was finalized now.
    pub async fn reconcile(&self, parent_id: Uuid) -> Result<Option<Job>, JobError> {
        let parent = self.store.get(parent_id).await?;
        if !parent.is_pipeline() {
            return Ok(None);
        }
        if parent.status.is_terminal() {
            if parent.status != JobStatus::Done {
                self.cascade(&parent).await?;
            }
            return Ok(None);
        }
        if parent.status != JobStatus::Running || parent.subjobs.is_empty() {
            return Ok(None);
        }

        let wanted: HashSet<Uuid> = parent.subjobs.values().copied().collect();
        let mut children: Vec<Job> = self
            .store
            .list_children(parent_id)
            .await?
            .into_iter()
            .filter(|c| wanted.contains(&c.id))
            .collect();

        let policy = self.config.policy_for(PIPELINE_TASK).on_subjob_failure;
        let any_failed = children.iter().any(|c| failed(c.status));

        match policy {
            SubjobFailurePolicy::Abort if any_failed => {
                let (_, result) = report(&parent.subjobs, &children);
                let finalized = self.finalize(parent_id, false, result).await?;
                if finalized.is_some() {
                    self.cascade(&parent).await?;
                }
                Ok(finalized)
            }
            _ => {
                if policy == SubjobFailurePolicy::Continue && any_failed {
                    self.drop_blocked(&mut children).await?;
                }
                if children.len() < wanted.len() || children.iter().any(|c| c.status.is_active()) {
                    return Ok(None);
                }
                let (ok, result) = report(&parent.subjobs, &children);
                self.finalize(parent_id, ok, result).await
            }
        }
    }

    /// Reconcile every running pipeline. Used at startup and after lag.
    pub async fn sweep(&self) -> Result<usize, JobError> {
        let mut finalized = 0;
        for job in self.store.list_by_status(JobStatus::Running).await? {
            if job.is_pipeline() && !job.subjobs.is_empty() {
                if self.reconcile(job.id).await?.is_some() {
                    finalized += 1;
                }
            }
        }
        if finalized > 0 {
            info!(finalized, "Pipeline sweep finalized parents");
        }
        Ok(finalized)
    }

    /// Listen for job events until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        events: Arc<JobEventBus>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Ok(event) => self.on_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Reconciler lagged behind job events, sweeping");
                            if let Err(e) = self.sweep().await {
                                error!(error = %e, "Pipeline sweep failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Pipeline reconciler stopped");
        })
    }

    async fn on_event(&self, event: JobEvent) {
        if !event.status.is_terminal() {
            return;
        }
        let target = match (event.parent_id, event.task.as_str()) {
            (Some(parent_id), _) => parent_id,
            (None, PIPELINE_TASK) if event.status != JobStatus::Done => event.id,
            _ => return,
        };
        if let Err(e) = self.reconcile(target).await {
            error!(job_id = %target, error = %e, "Pipeline reconcile failed");
        }
    }

    /// Cancel queued children whose predecessor failed, transitively.
    async fn drop_blocked(&self, children: &mut [Job]) -> Result<(), JobError> {
        let mut failed_ids: HashSet<Uuid> = children
            .iter()
            .filter(|c| failed(c.status))
            .map(|c| c.id)
            .collect();

        // Children are in creation order and only depend on earlier steps.
        for child in children.iter_mut() {
            let blocked = child.status == JobStatus::Queued
                && child.depends_on.is_some_and(|dep| failed_ids.contains(&dep));
            if blocked {
                *child = cancel_job(
                    self.store.as_ref(),
                    &self.cancels,
                    child.id,
                    "predecessor step failed",
                )
                .await?;
                if failed(child.status) {
                    failed_ids.insert(child.id);
                }
            }
        }
        Ok(())
    }

    async fn cascade(&self, parent: &Job) -> Result<(), JobError> {
        let canceled =
            cancel_children(self.store.as_ref(), &self.cancels, parent.id, "pipeline stopped")
                .await?;
        if canceled > 0 {
            info!(job_id = %parent.id, canceled, "Canceled remaining pipeline steps");
        }
        Ok(())
    }

    async fn finalize(
        &self,
        parent_id: Uuid,
        ok: bool,
        result: Value,
    ) -> Result<Option<Job>, JobError> {
        let outcome = store::modify(self.store.as_ref(), parent_id, |j| {
            if j.status != JobStatus::Running {
                return Err(JobError::InvalidTransition {
                    id: j.id,
                    from: j.status,
                    to: if ok { JobStatus::Done } else { JobStatus::Error },
                });
            }
            if ok {
                j.complete(result.clone())
            } else {
                j.transition_to(JobStatus::Error)?;
                j.last_error = Some("one or more pipeline steps failed".to_string());
                j.result = Some(result.clone());
                Ok(())
            }
        })
        .await;

        match outcome {
            Ok(parent) => {
                info!(job_id = %parent_id, status = %parent.status, "Pipeline finished");
                Ok(Some(parent))
            }
            // Someone else finished it first.
            Err(JobError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
