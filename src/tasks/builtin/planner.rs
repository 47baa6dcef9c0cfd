//! `plan` — produces a fixed step outline for a goal.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::tasks::handler::{TaskHandler, optional_text};

const DEFAULT_STEPS: &[&str] = &["collect inputs", "draft plan", "review", "finalize"];

const DEMO_STEPS: &[&str] = &[
    "analyze requirements",
    "propose approach",
    "execute minimal POC",
    "report metrics",
];

pub struct PlanTask;

#[async_trait]
impl TaskHandler for PlanTask {
    fn name(&self) -> &str {
        "plan"
    }

    fn description(&self) -> &str {
        "Outline the steps for reaching a goal."
    }

    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        ctx.checkpoint()?;

        let demo = payload.get("demo").and_then(Value::as_bool).unwrap_or(false);
        let steps = if demo { DEMO_STEPS } else { DEFAULT_STEPS };
        let goal = optional_text(&payload, "goal");

        Ok(json!({
            "ok": true,
            "agent": "planner",
            "task": self.name(),
            "goal": goal,
            "steps": steps,
            "inputs": payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plan_for_goal() {
        let out = PlanTask
            .execute(json!({"goal": "hello world"}), &TaskContext::default())
            .await
            .unwrap();
        assert_eq!(out["goal"], "hello world");
        assert_eq!(out["steps"].as_array().unwrap().len(), 4);
        assert_eq!(out["steps"][0], "collect inputs");
    }

    #[tokio::test]
    async fn demo_plan() {
        let out = PlanTask
            .execute(json!({"demo": true}), &TaskContext::default())
            .await
            .unwrap();
        assert_eq!(out["steps"][2], "execute minimal POC");
    }
}
