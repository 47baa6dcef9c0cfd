//! Worker system — claims jobs and drives them to a terminal state.
//!
//! Core components:
//! - `pool` — fixed set of executors (claim, run handler, persist outcome)
//! - `retry` — backoff and retry budget on handler failure
//! - `cancel` — in-process cancel flags and the cancel operation
//! - `watchdog` — deadline enforcement on running jobs

pub mod cancel;
pub mod pool;
pub mod retry;
pub mod watchdog;

pub use cancel::{CancelRegistry, cancel_children, cancel_job, request_cancel};
pub use pool::{Outcome, WorkerDeps, WorkerPool};
pub use retry::RetryManager;
pub use watchdog::Watchdog;
