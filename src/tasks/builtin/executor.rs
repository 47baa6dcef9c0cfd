//! `execute` — simulates running commands. Nothing is actually spawned.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::tasks::handler::TaskHandler;

const DEFAULT_COMMAND: &str = "echo 'no cmd provided'";

pub struct ExecuteTask {
    /// Simulated time per command.
    step_delay: Duration,
}

impl ExecuteTask {
    pub fn new() -> Self {
        Self {
            step_delay: Duration::from_millis(10),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Default for ExecuteTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands from `cmd` (string) or `cmds` (array of strings).
fn commands(payload: &Value) -> Result<Vec<String>, TaskError> {
    if let Some(cmds) = payload.get("cmds") {
        let list = cmds
            .as_array()
            .ok_or_else(|| TaskError::InvalidPayload("'cmds' must be an array".into()))?;
        return list
            .iter()
            .map(|c| {
                c.as_str().map(str::to_string).ok_or_else(|| {
                    TaskError::InvalidPayload("'cmds' entries must be strings".into())
                })
            })
            .collect();
    }
    let cmd = payload
        .get("cmd")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(DEFAULT_COMMAND);
    Ok(vec![cmd.to_string()])
}

#[async_trait]
impl TaskHandler for ExecuteTask {
    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        "Simulate running one or more commands."
    }

    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        let cmds = commands(&payload)?;

        let mut messages = Vec::with_capacity(cmds.len());
        for cmd in &cmds {
            ctx.checkpoint()?;
            tokio::time::sleep(self.step_delay).await;
            messages.push(format!("would run: {cmd}"));
        }

        let message = messages.join("\n");
        Ok(json!({
            "ok": true,
            "agent": "executor",
            "task": self.name(),
            "result": { "message": message, "commands": messages.len() },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelFlag;
    use uuid::Uuid;

    #[tokio::test]
    async fn simulates_single_command() {
        let out = ExecuteTask::new()
            .execute(json!({"cmd": "ls -la"}), &TaskContext::default())
            .await
            .unwrap();
        assert_eq!(out["result"]["message"], "would run: ls -la");
    }

    #[tokio::test]
    async fn default_command_when_missing() {
        let out = ExecuteTask::new()
            .execute(json!({}), &TaskContext::default())
            .await
            .unwrap();
        assert_eq!(out["result"]["message"], "would run: echo 'no cmd provided'");
    }

    #[tokio::test]
    async fn rejects_bad_command_list() {
        let err = ExecuteTask::new()
            .execute(json!({"cmds": "ls"}), &TaskContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn stops_at_checkpoint_when_canceled() {
        let flag = CancelFlag::new();
        flag.raise();
        let ctx = TaskContext::new(Uuid::new_v4()).with_cancel(flag);

        let err = ExecuteTask::new()
            .execute(json!({"cmds": ["a", "b"]}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Canceled);
    }
}
