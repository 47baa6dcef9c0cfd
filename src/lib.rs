//! Velu — job orchestration core.

pub mod api;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod tasks;
pub mod waiter;
pub mod worker;
