//! Built-in toy handlers: planning, analysis, simulated execution, reports and code scaffolds.

pub mod analyzer;
pub mod codegen;
pub mod executor;
pub mod planner;
pub mod reporter;

use std::sync::Arc;

use crate::tasks::handler::TaskHandler;

pub use analyzer::AnalyzeTask;
pub use codegen::CodegenTask;
pub use executor::ExecuteTask;
pub use planner::PlanTask;
pub use reporter::ReportTask;

/// Every built-in handler, ready to register.
pub fn all() -> Vec<Arc<dyn TaskHandler>> {
    vec![
        Arc::new(PlanTask),
        Arc::new(AnalyzeTask),
        Arc::new(ExecuteTask::new()),
        Arc::new(ReportTask),
        Arc::new(CodegenTask),
    ]
}
