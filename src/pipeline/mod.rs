//! Pipeline jobs — composite jobs that fan out into subjobs.
//!
//! 1. `PipelineSpec::parse()` — validate steps at submission
//! 2. `PipelineExpander::expand()` — create children once the parent is claimed
//! 3. `PipelineReconciler` — aggregate child outcomes into the parent's result

pub mod expander;
pub mod reconcile;

pub use expander::{PipelineExpander, PipelineMode, PipelineSpec, PipelineStep};
pub use reconcile::PipelineReconciler;
