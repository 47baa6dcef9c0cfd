//! `report` — formats a short text report.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::tasks::handler::{TaskHandler, optional_text};

/// Maximum characters of data quoted in the report text.
const SNIPPET_CHARS: usize = 160;

pub struct ReportTask;

#[async_trait]
impl TaskHandler for ReportTask {
    fn name(&self) -> &str {
        "report"
    }

    fn description(&self) -> &str {
        "Render a titled one-line report of the data."
    }

    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        ctx.checkpoint()?;

        let title = optional_text(&payload, "title")
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Report".to_string());
        // Falls back to the previous pipeline step's output.
        let data = optional_text(&payload, "data")
            .or_else(|| ctx.upstream.as_ref().map(Value::to_string));
        let snippet = match data {
            Some(d) => d.chars().take(SNIPPET_CHARS).collect(),
            None => "<no data>".to_string(),
        };

        Ok(json!({
            "ok": true,
            "agent": "reporter",
            "task": self.name(),
            "result": {
                "title": title,
                "text": format!("{title}: {snippet}"),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn truncates_data_snippet() {
        let long = "x".repeat(500);
        let out = ReportTask
            .execute(json!({"title": "Daily", "data": long}), &TaskContext::default())
            .await
            .unwrap();
        let text = out["result"]["text"].as_str().unwrap();
        assert!(text.starts_with("Daily: "));
        assert_eq!(text.len(), "Daily: ".len() + SNIPPET_CHARS);
    }

    #[tokio::test]
    async fn defaults_without_data() {
        let out = ReportTask
            .execute(json!({}), &TaskContext::default())
            .await
            .unwrap();
        assert_eq!(out["result"]["text"], "Report: <no data>");
    }
}
