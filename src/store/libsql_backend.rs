//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Claim is a single
//! `UPDATE … RETURNING` statement, so two workers can never receive the
//! same row; updates are compare-and-set on `version`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError};
use crate::job::{Job, JobStatus, NewJob};
use crate::store::migrations;
use crate::store::traits::{JobMutator, JobStore, check_mutation};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Job database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, JobError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_datetime(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_datetime(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad job id '{s}': {e}")))
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<u64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)),
        None => libsql::Value::Null,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_json(value: &impl serde::Serialize) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let task: String = row.get(1).map_err(get_err)?;
    let payload: String = row.get(2).map_err(get_err)?;
    let status: String = row.get(3).map_err(get_err)?;
    let result: Option<String> = row.get::<String>(4).ok();
    let parent_id: Option<String> = row.get::<String>(5).ok();
    let depends_on: Option<String> = row.get::<String>(6).ok();
    let subjobs: String = row.get(7).map_err(get_err)?;
    let priority: i64 = row.get(8).map_err(get_err)?;
    let attempts: i64 = row.get(9).map_err(get_err)?;
    let last_error: Option<String> = row.get::<String>(10).ok();
    let cancel_requested: i64 = row.get(11).map_err(get_err)?;
    let timeout_ms: Option<i64> = row.get::<i64>(12).ok();
    let not_before: Option<String> = row.get::<String>(13).ok();
    let created_at: String = row.get(14).map_err(get_err)?;
    let started_at: Option<String> = row.get::<String>(15).ok();
    let finished_at: Option<String> = row.get::<String>(16).ok();
    let version: i64 = row.get(17).map_err(get_err)?;

    let subjobs: BTreeMap<String, Uuid> = parse_json(&subjobs)?;

    Ok(Job {
        id: parse_uuid(&id)?,
        task,
        payload: parse_json(&payload)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        result: result.as_deref().map(parse_json).transpose()?,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        depends_on: depends_on.as_deref().map(parse_uuid).transpose()?,
        subjobs,
        priority,
        attempts: attempts.max(0) as u32,
        last_error,
        cancel_requested: cancel_requested != 0,
        timeout_ms: timeout_ms.map(|t| t.max(0) as u64),
        not_before: parse_optional_datetime(not_before)?,
        created_at: parse_datetime(&created_at)?,
        started_at: parse_optional_datetime(started_at)?,
        finished_at: parse_optional_datetime(finished_at)?,
        version,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, task, payload, status, result, parent_id, depends_on, subjobs, \
    priority, attempts, last_error, cancel_requested, timeout_ms, not_before, created_at, \
    started_at, finished_at, version";

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let job = new.into_job();

        self.conn()
            .execute(
                "INSERT INTO jobs (id, task, payload, status, parent_id, depends_on, subjobs, \
                 priority, attempts, timeout_ms, created_at, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id.to_string(),
                    job.task.clone(),
                    to_json(&job.payload)?,
                    job.status.as_str(),
                    opt_uuid(job.parent_id),
                    opt_uuid(job.depends_on),
                    to_json(&job.subjobs)?,
                    job.priority,
                    job.attempts as i64,
                    opt_integer(job.timeout_ms),
                    fmt_datetime(&job.created_at),
                    job.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.id, task = %job.task, "Job inserted into DB");
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobError> {
        let now = fmt_datetime(&Utc::now());
        let sql = format!(
            "UPDATE jobs SET status = 'running', started_at = ?1, version = version + 1
             WHERE seq = (
                 SELECT j.seq FROM jobs j
                 WHERE j.status = 'queued'
                   AND (j.not_before IS NULL OR j.not_before <= ?1)
                   AND (j.depends_on IS NULL OR EXISTS (
                       SELECT 1 FROM jobs d WHERE d.id = j.depends_on AND d.status = 'done'))
                   AND (j.parent_id IS NULL OR EXISTS (
                       SELECT 1 FROM jobs p WHERE p.id = j.parent_id AND p.subjobs != '{{}}'))
                 ORDER BY j.priority DESC, j.seq ASC
                 LIMIT 1
             ) AND status = 'queued'
             RETURNING {JOB_COLUMNS}"
        );

        let mut jobs = self.query_jobs("claim_next", &sql, params![now]).await?;
        Ok(jobs.pop())
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutator: JobMutator<'_>,
    ) -> Result<Job, JobError> {
        let before = self.get(id).await?;
        if before.version != expected_version {
            return Err(JobError::Conflict {
                id,
                expected: expected_version,
            });
        }

        let mut after = before.clone();
        mutator(&mut after)?;
        check_mutation(&before, &mut after)?;
        after.version = before.version + 1;

        let result = after.result.as_ref().map(|r| to_json(r)).transpose()?;
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, result = ?2, subjobs = ?3, attempts = ?4, \
                 last_error = ?5, cancel_requested = ?6, timeout_ms = ?7, not_before = ?8, \
                 started_at = ?9, finished_at = ?10, version = ?11 \
                 WHERE id = ?12 AND version = ?13",
                params![
                    after.status.as_str(),
                    opt_text_owned(result),
                    to_json(&after.subjobs)?,
                    after.attempts as i64,
                    opt_text_owned(after.last_error.clone()),
                    after.cancel_requested as i64,
                    opt_integer(after.timeout_ms),
                    opt_datetime(&after.not_before),
                    opt_datetime(&after.started_at),
                    opt_datetime(&after.finished_at),
                    after.version,
                    id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if affected == 0 {
            debug!(job_id = %id, expected_version, "Update lost a version race");
            return Err(JobError::Conflict {
                id,
                expected: expected_version,
            });
        }
        Ok(after)
    }

    async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        let mut jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        jobs.pop().ok_or(JobError::NotFound { id })
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        self.query_jobs(
            "list_recent",
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq DESC LIMIT ?1"),
            params![limit as i64],
        )
        .await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobError> {
        self.query_jobs(
            "list_by_status",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY seq ASC"),
            params![status.as_str()],
        )
        .await
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, JobError> {
        self.query_jobs(
            "list_children",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ?1 ORDER BY seq ASC"),
            params![parent_id.to_string()],
        )
        .await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_by_status: {e}")).into()),
        }
    }

    async fn ping(&self) -> Result<(), JobError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }
}
