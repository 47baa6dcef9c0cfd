//! Pipeline payload parsing and fan-out into child jobs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::JobError;
use crate::job::{Job, JobStatus, NewJob, PIPELINE_TASK};
use crate::store::{self, JobStore};
use crate::tasks::TaskRegistry;

/// How steps without an explicit `after` are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Each step waits for the one before it.
    Sequential,
    /// Steps are independent unless they name a predecessor.
    Parallel,
}

/// One validated step.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStep {
    pub name: String,
    pub task: String,
    /// Shared input overlaid with the step's own payload.
    pub payload: Value,
    /// Step that must be `done` first.
    pub after: Option<String>,
}

/// A parsed and validated pipeline payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub mode: PipelineMode,
    pub steps: Vec<PipelineStep>,
}

fn invalid(message: impl Into<String>) -> JobError {
    JobError::Validation(message.into())
}

impl PipelineSpec {
    /// Parse a pipeline payload, checking every step against the registry.
    pub fn parse(payload: &Value, registry: &TaskRegistry) -> Result<Self, JobError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| invalid("pipeline payload must be an object"))?;

        let mode = match obj.get("mode") {
            None | Some(Value::Null) => PipelineMode::Sequential,
            Some(Value::String(m)) => match m.trim().to_lowercase().as_str() {
                "sequential" => PipelineMode::Sequential,
                "parallel" => PipelineMode::Parallel,
                other => return Err(invalid(format!("unknown pipeline mode '{other}'"))),
            },
            Some(_) => return Err(invalid("pipeline 'mode' must be a string")),
        };

        let input = match obj.get("input") {
            Some(Value::Object(input)) => input.clone(),
            Some(Value::Null) | None => {
                let mut shared = obj.clone();
                shared.remove("steps");
                shared.remove("mode");
                shared
            }
            Some(_) => return Err(invalid("pipeline 'input' must be an object")),
        };

        let raw_steps = obj
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("pipeline payload needs a 'steps' array"))?;
        if raw_steps.is_empty() {
            return Err(invalid("pipeline needs at least one step"));
        }

        let mut seen = HashSet::new();
        let mut steps: Vec<PipelineStep> = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            let step = parse_step(index, raw, &input)?;

            if step.task == PIPELINE_TASK {
                return Err(invalid(format!(
                    "step '{}': nested pipelines are not supported",
                    step.name
                )));
            }
            if !registry.has(&step.task) {
                return Err(JobError::UnknownTask { name: step.task });
            }
            if let Some(after) = &step.after {
                if !seen.contains(after) {
                    return Err(invalid(format!(
                        "step '{}' runs after '{after}', which is not an earlier step",
                        step.name
                    )));
                }
            }
            if !seen.insert(step.name.clone()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }

            let after = match (mode, step.after.clone()) {
                (_, Some(after)) => Some(after),
                (PipelineMode::Sequential, None) => steps.last().map(|prev| prev.name.clone()),
                (PipelineMode::Parallel, None) => None,
            };
            steps.push(PipelineStep { after, ..step });
        }

        Ok(Self { mode, steps })
    }
}

fn parse_step(
    index: usize,
    raw: &Value,
    input: &Map<String, Value>,
) -> Result<PipelineStep, JobError> {
    match raw {
        Value::String(task) => {
            let task = task.trim().to_lowercase();
            if task.is_empty() {
                return Err(invalid(format!("step {index} has an empty task name")));
            }
            Ok(PipelineStep {
                name: task.clone(),
                task,
                payload: Value::Object(input.clone()),
                after: None,
            })
        }
        Value::Object(step) => {
            let text = |key: &str| -> Result<Option<String>, JobError> {
                match step.get(key) {
                    None | Some(Value::Null) => Ok(None),
                    Some(Value::String(s)) if !s.trim().is_empty() => {
                        Ok(Some(s.trim().to_string()))
                    }
                    Some(_) => Err(invalid(format!(
                        "step {index}: '{key}' must be a non-empty string"
                    ))),
                }
            };

            let task = text("task")?
                .or(text("name")?)
                .ok_or_else(|| invalid(format!("step {index} needs a 'task'")))?
                .to_lowercase();
            let name = text("name")?.unwrap_or_else(|| task.clone());
            let after = text("after")?;

            let mut payload = input.clone();
            match step.get("payload") {
                None | Some(Value::Null) => {}
                Some(Value::Object(own)) => {
                    for (key, value) in own {
                        payload.insert(key.clone(), value.clone());
                    }
                }
                Some(_) => {
                    return Err(invalid(format!("step '{name}': 'payload' must be an object")));
                }
            }

            Ok(PipelineStep {
                name,
                task,
                payload: Value::Object(payload),
                after,
            })
        }
        _ => Err(invalid(format!("step {index} must be a task name or an object"))),
    }
}

/// Creates the child jobs of a pipeline and records the step mapping.
pub struct PipelineExpander {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    config: Arc<OrchestratorConfig>,
}

impl PipelineExpander {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Expand a claimed pipeline job exactly once.
    ///
    /// Children stay unclaimable until the parent's mapping is written. If
    /// writing it fails, the children are canceled before the error returns.
    pub async fn expand(&self, parent: &Job) -> Result<Job, JobError> {
        if !parent.subjobs.is_empty() {
            debug!(job_id = %parent.id, "Pipeline already expanded");
            return Ok(parent.clone());
        }

        let spec = PipelineSpec::parse(&parent.payload, &self.registry)?;

        // Leftovers from an expansion that died before writing the mapping.
        let stale = self.cancel_children(parent.id, "superseded by re-expansion").await;
        if stale > 0 {
            warn!(job_id = %parent.id, stale, "Discarded children of an interrupted expansion");
        }

        let mut mapping: BTreeMap<String, Uuid> = BTreeMap::new();
        for step in &spec.steps {
            let depends_on = step.after.as_ref().and_then(|name| mapping.get(name).copied());
            let timeout = self.config.policy_for(&step.task).timeout;
            let new = NewJob::new(step.task.clone(), step.payload.clone())
                .with_parent(parent.id)
                .with_dependency(depends_on)
                .with_priority(parent.priority)
                .with_timeout(timeout);

            match self.store.create(new).await {
                Ok(child) => {
                    mapping.insert(step.name.clone(), child.id);
                }
                Err(e) => {
                    self.cancel_children(parent.id, "pipeline expansion failed").await;
                    return Err(e);
                }
            }
        }

        let result = store::modify(self.store.as_ref(), parent.id, |j| {
            if j.status != JobStatus::Running {
                return Err(JobError::InvalidTransition {
                    id: j.id,
                    from: j.status,
                    to: JobStatus::Running,
                });
            }
            if !j.subjobs.is_empty() {
                return Err(invalid(format!("pipeline {} was expanded concurrently", j.id)));
            }
            j.subjobs = mapping.clone();
            Ok(())
        })
        .await;

        match result {
            Ok(expanded) => {
                info!(
                    job_id = %parent.id,
                    steps = expanded.subjobs.len(),
                    mode = ?spec.mode,
                    "Pipeline expanded"
                );
                Ok(expanded)
            }
            Err(e) => {
                self.cancel_children(parent.id, "pipeline expansion failed").await;
                Err(e)
            }
        }
    }

    /// Best-effort cancel of unfinished children. Returns how many were canceled.
    async fn cancel_children(&self, parent_id: Uuid, reason: &str) -> usize {
        let children = match self.store.list_children(parent_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(job_id = %parent_id, error = %e, "Could not list pipeline children");
                return 0;
            }
        };

        let mut canceled = 0;
        for child in children.into_iter().filter(|c| c.status == JobStatus::Queued) {
            match store::modify(self.store.as_ref(), child.id, |j| j.cancel(reason)).await {
                Ok(_) => canceled += 1,
                Err(e) => debug!(job_id = %child.id, error = %e, "Child cancel skipped"),
            }
        }
        canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        TaskRegistry::with_builtins()
    }

    #[test]
    fn shorthand_steps_run_sequentially() {
        let spec = PipelineSpec::parse(
            &json!({"steps": ["plan", "codegen"], "goal": "hello"}),
            &registry(),
        )
        .unwrap();
        assert_eq!(spec.mode, PipelineMode::Sequential);
        assert_eq!(spec.steps[0].name, "plan");
        assert_eq!(spec.steps[0].after, None);
        assert_eq!(spec.steps[1].after.as_deref(), Some("plan"));
        assert_eq!(spec.steps[1].payload, json!({"goal": "hello"}));
    }

    #[test]
    fn parallel_steps_are_independent() {
        let spec = PipelineSpec::parse(
            &json!({
                "mode": "parallel",
                "input": {"goal": "x", "lang": "python"},
                "steps": [
                    "plan",
                    {"name": "gen", "task": "codegen", "payload": {"spec": "tool"}},
                    {"name": "summary", "task": "report", "after": "gen"}
                ]
            }),
            &registry(),
        )
        .unwrap();
        assert_eq!(spec.steps[1].after, None);
        assert_eq!(
            spec.steps[1].payload,
            json!({"goal": "x", "lang": "python", "spec": "tool"})
        );
        assert_eq!(spec.steps[2].after.as_deref(), Some("gen"));
    }

    #[test]
    fn validation_failures() {
        let reg = registry();
        let cases = [
            json!({}),
            json!({"steps": []}),
            json!({"steps": ["plan", "plan"]}),
            json!({"steps": [
                {"task": "plan", "after": "later"},
                {"name": "later", "task": "report"},
            ]}),
            json!({"steps": ["pipeline"]}),
            json!({"steps": [42]}),
            json!({"mode": "random", "steps": ["plan"]}),
        ];
        for case in cases {
            let err = PipelineSpec::parse(&case, &reg).unwrap_err();
            assert!(err.is_validation(), "{case} should be rejected, got {err}");
        }

        let err = PipelineSpec::parse(&json!({"steps": ["deploy"]}), &reg).unwrap_err();
        assert!(matches!(err, JobError::UnknownTask { name } if name == "deploy"));
    }

    async fn claimed_pipeline(store: &Arc<dyn JobStore>, payload: Value) -> Job {
        store.create(NewJob::new(PIPELINE_TASK, payload)).await.unwrap();
        store.claim_next().await.unwrap().unwrap()
    }

    fn expander(store: &Arc<dyn JobStore>) -> PipelineExpander {
        PipelineExpander::new(
            Arc::clone(store),
            Arc::new(registry()),
            Arc::new(OrchestratorConfig::default()),
        )
    }

    #[tokio::test]
    async fn expand_creates_children_and_mapping() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let parent = claimed_pipeline(&store, json!({"steps": ["plan", "codegen"]})).await;

        let expanded = expander(&store).expand(&parent).await.unwrap();
        assert_eq!(
            expanded.subjobs.keys().cloned().collect::<Vec<_>>(),
            vec!["codegen", "plan"]
        );

        let plan = store.get(expanded.subjobs["plan"]).await.unwrap();
        let codegen = store.get(expanded.subjobs["codegen"]).await.unwrap();
        assert_eq!(plan.parent_id, Some(parent.id));
        assert_eq!(codegen.depends_on, Some(plan.id));
        assert_eq!(plan.timeout_ms, Some(300_000));

        // Only the first step is claimable.
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, plan.id);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expand_is_idempotent() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let parent = claimed_pipeline(&store, json!({"steps": ["plan"]})).await;
        let expander = expander(&store);

        let first = expander.expand(&parent).await.unwrap();
        let again = expander.expand(&first).await.unwrap();
        assert_eq!(first.subjobs, again.subjobs);
        assert_eq!(store.list_children(parent.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_mapping_write_cancels_children() {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let parent = claimed_pipeline(&store, json!({"steps": ["plan", "report"]})).await;
        // Parent canceled before the mapping lands.
        store
            .update(parent.id, parent.version, &|j: &mut Job| j.cancel("user"))
            .await
            .unwrap();

        let err = expander(&store).expand(&parent).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        for child in store.list_children(parent.id).await.unwrap() {
            assert_eq!(child.status, JobStatus::Canceled);
        }
    }
}
