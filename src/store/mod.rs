//! Persistence layer — job storage behind the `JobStore` trait.

pub mod libsql_backend;
pub mod migrations;
pub mod notifying;
pub mod traits;

use tracing::debug;
use uuid::Uuid;

pub use libsql_backend::LibSqlBackend;
pub use notifying::NotifyingStore;
pub use traits::{JobMutator, JobStore, check_mutation};

use crate::error::JobError;
use crate::job::Job;

/// How many times `modify` re-reads after losing a version race.
const MAX_CONFLICT_RETRIES: usize = 16;

/// Read-modify-write with optimistic retry.
///
/// Re-reads and re-applies `f` whenever the version moved underneath, so
/// `JobError::Conflict` only escapes after sustained contention.
pub async fn modify<F>(store: &dyn JobStore, id: Uuid, f: F) -> Result<Job, JobError>
where
    F: Fn(&mut Job) -> Result<(), JobError> + Send + Sync,
{
    let mut attempt = 0;
    loop {
        let current = store.get(id).await?;
        match store.update(id, current.version, &f).await {
            Err(JobError::Conflict { expected, .. }) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(job_id = %id, expected, attempt, "Version conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
