//! Job data model.
//!
//! - `state` — status state machine (queued → running → done/error/canceled)
//! - `model` — the persisted `Job` record and the `NewJob` creation request

pub mod model;
pub mod state;

pub use model::{Job, NewJob, PIPELINE_TASK};
pub use state::JobStatus;
