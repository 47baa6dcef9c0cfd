//! Orchestrator runtime — wires the store, workers and background loops.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::JobError;
use crate::events::JobEventBus;
use crate::pipeline::{PipelineExpander, PipelineReconciler};
use crate::store::{JobStore, NotifyingStore};
use crate::tasks::TaskRegistry;
use crate::waiter::ResultWaiter;
use crate::worker::{CancelRegistry, RetryManager, Watchdog, WorkerDeps, WorkerPool};

/// A running orchestrator. Dropping it does not stop the background tasks;
/// call [`Orchestrator::shutdown`].
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    waiter: ResultWaiter,
    store: Arc<dyn JobStore>,
    events: Arc<JobEventBus>,
    config: Arc<OrchestratorConfig>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wrap `backend` with event publishing, recover stale work and start
    /// the worker pool, the watchdog and the pipeline reconciler.
    pub async fn start(
        backend: Arc<dyn JobStore>,
        registry: TaskRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self, JobError> {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let events = JobEventBus::new();
        let store: Arc<dyn JobStore> = Arc::new(NotifyingStore::new(backend, Arc::clone(&events)));
        let cancels = Arc::new(CancelRegistry::new());

        let retry = Arc::new(RetryManager::new(Arc::clone(&store), Arc::clone(&config)));
        let expander = Arc::new(PipelineExpander::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        let reconciler = Arc::new(PipelineReconciler::new(
            Arc::clone(&store),
            Arc::clone(&cancels),
            Arc::clone(&config),
        ));
        let watchdog = Arc::new(Watchdog::new(Arc::clone(&store), Arc::clone(&cancels)));
        let pool = WorkerPool::new(WorkerDeps {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            events: Arc::clone(&events),
            cancels: Arc::clone(&cancels),
            retry,
            expander,
            config: Arc::clone(&config),
        });

        // ── Startup Recovery ────────────────────────────────────────────
        if config.recover_on_start {
            pool.recover().await?;
        }
        if let Err(e) = reconciler.sweep().await {
            warn!(error = %e, "Startup pipeline sweep failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        handles.push(Arc::clone(&reconciler).spawn(Arc::clone(&events), shutdown_rx.clone()));
        handles.push(watchdog.spawn(config.watchdog_interval, shutdown_rx.clone()));
        handles.extend(pool.spawn(shutdown_rx));

        info!(
            workers = config.workers,
            tasks = registry.count(),
            "Orchestrator started"
        );

        let waiter = ResultWaiter::new(Arc::clone(&store), Arc::clone(&events));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            registry,
            cancels,
            waiter.clone(),
            Arc::clone(&config),
        ));

        Ok(Self {
            dispatcher,
            waiter,
            store,
            events,
            config,
            shutdown_tx,
            handles: Mutex::new(handles),
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn waiter(&self) -> &ResultWaiter {
        &self.waiter
    }

    /// The event-publishing store every component writes through.
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn events(&self) -> Arc<JobEventBus> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Signal every background task to stop and wait for them.
    ///
    /// Handlers in flight finish their current job first.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob, PIPELINE_TASK};
    use crate::store::LibSqlBackend;
    use crate::tasks::builtin::ExecuteTask;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 2,
            idle_backoff: Duration::from_millis(20),
            watchdog_interval: Duration::from_millis(20),
            ..OrchestratorConfig::default()
        }
    }

    async fn start() -> Orchestrator {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Orchestrator::start(backend, TaskRegistry::with_builtins(), fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plan_submission_completes() {
        let orch = start().await;
        let id = orch
            .dispatcher()
            .submit("plan", json!({"goal": "hello world"}))
            .await
            .unwrap();

        let job = orch.waiter().wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result.unwrap()["goal"], "hello world");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_reaches_running_handler() {
        let mut registry = TaskRegistry::new();
        let execute = ExecuteTask::new().with_step_delay(Duration::from_millis(20));
        registry.register(Arc::new(execute));
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orch = Orchestrator::start(backend, registry, fast_config())
            .await
            .unwrap();

        let cmds: Vec<String> = (0..500).map(|i| format!("echo {i}")).collect();
        let id = orch
            .dispatcher()
            .submit("execute", json!({ "cmds": cmds }))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.store().get(id).await.unwrap().status != JobStatus::Running {
            assert!(tokio::time::Instant::now() < deadline, "job never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let flagged = orch.dispatcher().cancel(id).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancel_requested);

        let job = orch.waiter().wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        let result = job.result.unwrap();
        assert_eq!(result["error"], "canceled");
        assert_eq!(result["reason"], "canceled at checkpoint");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn pipeline_finishes_after_all_steps() {
        let orch = start().await;
        let id = orch
            .dispatcher()
            .submit(PIPELINE_TASK, json!({"steps": ["plan", "codegen"], "idea": "todo api"}))
            .await
            .unwrap();

        let parent = orch.waiter().wait_for(id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(parent.status, JobStatus::Done);
        assert_eq!(
            parent.subjobs.keys().cloned().collect::<Vec<_>>(),
            vec!["codegen".to_string(), "plan".to_string()]
        );
        for child_id in parent.subjobs.values() {
            let child = orch.store().get(*child_id).await.unwrap();
            assert_eq!(child.status, JobStatus::Done);
            assert!(child.finished_at.unwrap() <= parent.finished_at.unwrap());
        }
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn startup_recovers_stale_running_job() {
        let backend: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        backend
            .create(NewJob::new("analyze", json!({"a": 1})))
            .await
            .unwrap();
        let stale = backend.claim_next().await.unwrap().unwrap();

        let config = OrchestratorConfig {
            retry_base: Duration::ZERO,
            ..fast_config()
        };
        let orch = Orchestrator::start(backend, TaskRegistry::with_builtins(), config)
            .await
            .unwrap();

        let job = orch.waiter().wait_for(stale.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 1);
        orch.shutdown().await;
    }
}
