//! Task handler trait and payload helper.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::TaskContext;
use crate::error::TaskError;

/// A named unit of work the worker pool can execute.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task name jobs are submitted under.
    fn name(&self) -> &str;

    /// One-line description for listings.
    fn description(&self) -> &str;

    /// Run the task.
    ///
    /// `TaskError::Failed` is retried per policy; `InvalidPayload` and
    /// `Canceled` are terminal.
    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError>;
}

/// Read an optional field as display text; non-strings are rendered as JSON.
pub fn optional_text(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_text_renders_values() {
        let payload = json!({"a": "s", "b": 4, "c": null});
        assert_eq!(optional_text(&payload, "a").as_deref(), Some("s"));
        assert_eq!(optional_text(&payload, "b").as_deref(), Some("4"));
        assert!(optional_text(&payload, "c").is_none());
        assert!(optional_text(&payload, "d").is_none());
    }
}
