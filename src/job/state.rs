//! Job status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed by a worker (or parked, for pipeline parents).
    Running,
    /// Finished successfully.
    Done,
    /// Failed terminally (retries exhausted, rejected, timed out, or a subjob failed).
    Error,
    /// Canceled before completion.
    Canceled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Running -> Queued` exists only for the retry path, which also bumps
    /// the attempt counter.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Canceled) |
            // From Running
            (Running, Done) | (Running, Error) |
            (Running, Canceled) | (Running, Queued)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    /// Check if the job is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Stable string used on the wire and in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}
