//! Error types for the velu job orchestrator.

use uuid::Uuid;

use crate::job::JobStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence failures. Any of these aborts the operation that hit it.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle and admission errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} was modified concurrently (expected version {expected})")]
    Conflict { id: Uuid, expected: i64 },

    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Unknown task: {name}")]
    UnknownTask { name: String },

    #[error("Queue is full ({queued} queued, limit {limit})")]
    QueueFull { queued: u64, limit: u64 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl JobError {
    /// Errors a caller caused with a bad request; never retried and never stored.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownTask { .. })
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Handler logic failed; governed by the retry policy.
    #[error("{0}")]
    Failed(String),

    /// Payload is unusable for this task; retrying cannot help.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler observed a cancellation request at a checkpoint.
    #[error("canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_classification() {
        assert!(JobError::Validation("empty task".into()).is_validation());
        assert!(JobError::UnknownTask { name: "x".into() }.is_validation());
        assert!(!JobError::QueueFull { queued: 5, limit: 5 }.is_validation());
        assert!(!JobError::NotFound { id: Uuid::nil() }.is_validation());
    }

    #[test]
    fn transition_error_message() {
        let err = JobError::InvalidTransition {
            id: Uuid::nil(),
            from: JobStatus::Done,
            to: JobStatus::Running,
        };
        assert!(err.to_string().contains("already in state done"));
    }
}
