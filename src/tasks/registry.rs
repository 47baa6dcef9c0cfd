//! Task registry — task name to handler.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::job::PIPELINE_TASK;
use crate::tasks::builtin;
use crate::tasks::handler::TaskHandler;

/// Registry of available task handlers, populated at startup.
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry holding every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for handler in builtin::all() {
            registry.register(handler);
        }
        registry
    }

    /// Register a handler. `pipeline` is reserved for the orchestrator itself.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().trim().to_lowercase();
        if name == PIPELINE_TASK {
            warn!("Rejected handler registration: '{PIPELINE_TASK}' is reserved");
            return;
        }
        debug!(task = %name, "Registered task handler");
        self.handlers.insert(name, handler);
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check if a handler exists.
    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Whether jobs may be submitted under this name (handlers plus `pipeline`).
    pub fn is_known(&self, name: &str) -> bool {
        name == PIPELINE_TASK || self.has(name)
    }

    /// List all handler names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
