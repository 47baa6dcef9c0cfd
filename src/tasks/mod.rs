//! Task handlers the worker pool dispatches to.

pub mod builtin;
pub mod handler;
pub mod registry;

pub use handler::{TaskHandler, optional_text};
pub use registry::TaskRegistry;
