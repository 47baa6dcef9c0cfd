//! `analyze` — counts payload keys.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::tasks::handler::TaskHandler;

pub struct AnalyzeTask;

#[async_trait]
impl TaskHandler for AnalyzeTask {
    fn name(&self) -> &str {
        "analyze"
    }

    fn description(&self) -> &str {
        "Summarize the shape of the payload."
    }

    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        ctx.checkpoint()?;

        let keys: Vec<&String> = payload
            .as_object()
            .map(|obj| obj.keys().collect())
            .unwrap_or_default();

        Ok(json!({
            "ok": true,
            "agent": "analyzer",
            "task": self.name(),
            "result": {
                "key_count": keys.len(),
                "keys": keys,
                "summary": "analysis complete",
            },
            "upstream": ctx.upstream,
        }))
    }
}
