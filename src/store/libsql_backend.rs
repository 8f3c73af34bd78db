//! libSQL backend — async `JobStore` implementation.
//!
//! Local file and in-memory databases. Writes are serialized behind an async
//! lock (one connection, and SQLite transactions are connection-scoped);
//! per-job write *ordering* still comes from the CAS `version` column.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Evidence, Job, JobStatus, ProviderId, SourceCategory, Stance, SubTask, SubTaskStatus,
};
use crate::store::traits::JobStore;

/// libSQL-backed job store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
    /// SQLite transactions are connection-scoped: any statement issued on
    /// the connection between BEGIN and COMMIT joins the open transaction.
    /// Every write takes this lock so concurrent writes neither race on
    /// BEGIN nor land inside another task's transaction.
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn open_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY,
                    topic TEXT NOT NULL,
                    context_url TEXT,
                    overall_status TEXT NOT NULL CHECK(overall_status IN
                        ('pending','in_progress','completed','partial_success',
                         'failed','cancelled','timeout')),
                    error_message TEXT,
                    callback_token TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(overall_status);

                CREATE TABLE IF NOT EXISTS sub_tasks (
                    sub_task_id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                    provider_id TEXT NOT NULL CHECK(provider_id IN
                        ('UNIVERSAL_AGENT','DEEP_READER','SCOUT','LOCAL_QUICK')),
                    task_type TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN
                        ('pending','in_progress','completed','failed','cancelled','timeout')),
                    result_payload TEXT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_sub_tasks_job ON sub_tasks(job_id);
                CREATE INDEX IF NOT EXISTS idx_sub_tasks_status ON sub_tasks(status);

                CREATE TABLE IF NOT EXISTS evidence (
                    id TEXT PRIMARY KEY,
                    sub_task_id TEXT NOT NULL,
                    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                    url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    stance TEXT NOT NULL CHECK(stance IN ('PRO','CON','NEUTRAL')),
                    snippet TEXT,
                    source TEXT,
                    source_category TEXT NOT NULL CHECK(source_category IN
                        ('NEWS','COMMUNITY','BLOG','OFFICIAL','ACADEMIC')),
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_evidence_job ON evidence(job_id);",
            )
            .await
            .map_err(|e| StoreError::Query(format!("Schema init failed: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("Bad UUID {s}: {e}")))
}

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let job_id: String = row.get(0).map_err(query_err)?;
    let topic: String = row.get(1).map_err(query_err)?;
    let context_url: Option<String> = row.get(2).map_err(query_err)?;
    let status_str: String = row.get(3).map_err(query_err)?;
    let error_message: Option<String> = row.get(4).map_err(query_err)?;
    let callback_token: String = row.get(5).map_err(query_err)?;
    let version: i64 = row.get(6).map_err(query_err)?;
    let created_at: String = row.get(7).map_err(query_err)?;
    let updated_at: String = row.get(8).map_err(query_err)?;
    let completed_at: Option<String> = row.get(9).map_err(query_err)?;

    let overall_status = JobStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Serialization(format!("Bad job status: {status_str}")))?;

    Ok(Job {
        job_id: parse_uuid(&job_id)?,
        topic,
        context_url,
        overall_status,
        error_message,
        callback_token,
        version,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        completed_at: parse_optional_datetime(completed_at),
    })
}

fn row_to_subtask(row: &libsql::Row) -> Result<SubTask, StoreError> {
    let sub_task_id: String = row.get(0).map_err(query_err)?;
    let job_id: String = row.get(1).map_err(query_err)?;
    let provider_str: String = row.get(2).map_err(query_err)?;
    let task_type: String = row.get(3).map_err(query_err)?;
    let status_str: String = row.get(4).map_err(query_err)?;
    let result_payload: Option<String> = row.get(5).map_err(query_err)?;
    let error_message: Option<String> = row.get(6).map_err(query_err)?;
    let retry_count: i64 = row.get(7).map_err(query_err)?;
    let created_at: String = row.get(8).map_err(query_err)?;
    let updated_at: String = row.get(9).map_err(query_err)?;
    let completed_at: Option<String> = row.get(10).map_err(query_err)?;

    let provider_id = ProviderId::parse(&provider_str)
        .ok_or_else(|| StoreError::Serialization(format!("Bad provider: {provider_str}")))?;
    let status = SubTaskStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Serialization(format!("Bad sub-task status: {status_str}")))?;

    Ok(SubTask {
        sub_task_id: parse_uuid(&sub_task_id)?,
        job_id: parse_uuid(&job_id)?,
        provider_id,
        task_type,
        status,
        result_payload,
        error_message,
        retry_count: retry_count.max(0) as u32,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        completed_at: parse_optional_datetime(completed_at),
    })
}

fn row_to_evidence(row: &libsql::Row) -> Result<Evidence, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let sub_task_id: String = row.get(1).map_err(query_err)?;
    let job_id: String = row.get(2).map_err(query_err)?;
    let url: String = row.get(3).map_err(query_err)?;
    let title: String = row.get(4).map_err(query_err)?;
    let stance_str: String = row.get(5).map_err(query_err)?;
    let snippet: Option<String> = row.get(6).map_err(query_err)?;
    let source: Option<String> = row.get(7).map_err(query_err)?;
    let category_str: String = row.get(8).map_err(query_err)?;
    let created_at: String = row.get(9).map_err(query_err)?;

    let source_category = SourceCategory::parse(&category_str)
        .ok_or_else(|| StoreError::Serialization(format!("Bad category: {category_str}")))?;

    Ok(Evidence {
        id: parse_uuid(&id)?,
        sub_task_id: parse_uuid(&sub_task_id)?,
        job_id: parse_uuid(&job_id)?,
        url,
        title,
        stance: Stance::parse(&stance_str),
        snippet,
        source,
        source_category,
        created_at: parse_datetime(&created_at),
    })
}

const JOB_COLUMNS: &str = "job_id, topic, context_url, overall_status, error_message, \
     callback_token, version, created_at, updated_at, completed_at";

const SUBTASK_COLUMNS: &str = "sub_task_id, job_id, provider_id, task_type, status, \
     result_payload, error_message, retry_count, created_at, updated_at, completed_at";

#[async_trait]
impl JobStore for LibSqlStore {
    async fn create_job(&self, job: &Job, sub_tasks: &[SubTask]) -> Result<(), StoreError> {
        // Held across the whole transaction so no other write can join it.
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to begin transaction: {e}")))?;

        tx.execute(
            "INSERT INTO jobs (job_id, topic, context_url, overall_status, error_message,
                 callback_token, version, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.job_id.to_string(),
                job.topic.clone(),
                job.context_url.clone(),
                job.overall_status.as_str(),
                job.error_message.clone(),
                job.callback_token.clone(),
                job.version,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| StoreError::Constraint(format!("Insert job failed: {e}")))?;

        for sub in sub_tasks {
            tx.execute(
                "INSERT INTO sub_tasks (sub_task_id, job_id, provider_id, task_type, status,
                     result_payload, error_message, retry_count, created_at, updated_at,
                     completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sub.sub_task_id.to_string(),
                    sub.job_id.to_string(),
                    sub.provider_id.as_str(),
                    sub.task_type.clone(),
                    sub.status.as_str(),
                    sub.result_payload.clone(),
                    sub.error_message.clone(),
                    sub.retry_count as i64,
                    sub.created_at.to_rfc3339(),
                    sub.updated_at.to_rfc3339(),
                    sub.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| StoreError::Constraint(format!("Insert sub-task failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("Commit failed: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_subtask(&self, sub_task_id: Uuid) -> Result<Option<SubTask>, StoreError> {
        let columns = SUBTASK_COLUMNS
            .split(", ")
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {columns}, j.job_id FROM sub_tasks s
                     LEFT JOIN jobs j ON j.job_id = s.job_id
                     WHERE s.sub_task_id = ?1"
                ),
                params![sub_task_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };
        let sub = row_to_subtask(&row)?;

        // A sub-task whose parent job is gone is a structural error.
        let parent: Option<String> = row.get(11).map_err(query_err)?;
        if parent.is_none() {
            return Err(StoreError::OrphanSubTask {
                sub_task_id: sub.sub_task_id,
                job_id: sub.job_id,
            });
        }
        Ok(Some(sub))
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let mut rows = match status {
            Some(status) => self
                .conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE overall_status = ?1
                         ORDER BY created_at DESC"
                    ),
                    params![status.as_str()],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn
                .query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"),
                    params![],
                )
                .await
                .map_err(query_err)?,
        };

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn list_subtasks(&self, job_id: Uuid) -> Result<Vec<SubTask>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM sub_tasks WHERE job_id = ?1
                     ORDER BY created_at ASC, sub_task_id ASC"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            subs.push(row_to_subtask(&row)?);
        }
        Ok(subs)
    }

    async fn mark_job_in_progress(&self, job_id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "UPDATE jobs SET overall_status = 'in_progress', updated_at = ?2
                 WHERE job_id = ?1 AND overall_status = 'pending'",
                params![job_id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_subtask_in_progress(&self, sub_task_id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "UPDATE sub_tasks SET status = 'in_progress', updated_at = ?2
                 WHERE sub_task_id = ?1 AND status = 'pending'",
                params![sub_task_id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());

        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET overall_status = ?2, error_message = ?3,
                     version = version + 1, updated_at = ?4,
                     completed_at = COALESCE(?5, completed_at)
                 WHERE job_id = ?1 AND version = ?6",
                params![
                    job_id.to_string(),
                    status.as_str(),
                    error_message,
                    now,
                    completed_at,
                    expected_version,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn finish_subtask(
        &self,
        sub_task_id: Uuid,
        status: SubTaskStatus,
        result_payload: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());

        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE sub_tasks SET status = ?2,
                     result_payload = COALESCE(?3, result_payload),
                     error_message = ?4, updated_at = ?5,
                     completed_at = COALESCE(?6, completed_at)
                 WHERE sub_task_id = ?1 AND status IN ('pending', 'in_progress')",
                params![
                    sub_task_id.to_string(),
                    status.as_str(),
                    result_payload,
                    error_message,
                    now,
                    completed_at,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO evidence (id, sub_task_id, job_id, url, title, stance,
                     snippet, source, source_category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    evidence.id.to_string(),
                    evidence.sub_task_id.to_string(),
                    evidence.job_id.to_string(),
                    evidence.url.clone(),
                    evidence.title.clone(),
                    evidence.stance.as_str(),
                    evidence.snippet.clone(),
                    evidence.source.clone(),
                    evidence.source_category.as_str(),
                    evidence.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Constraint(format!("Insert evidence failed: {e}")))?;
        Ok(())
    }

    async fn list_evidence(&self, job_id: Uuid) -> Result<Vec<Evidence>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, sub_task_id, job_id, url, title, stance, snippet, source,
                        source_category, created_at
                 FROM evidence WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut evidence = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            evidence.push(row_to_evidence(&row)?);
        }
        Ok(evidence)
    }

    async fn list_active_subtasks(&self) -> Result<Vec<SubTask>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM sub_tasks
                     WHERE status IN ('pending', 'in_progress')
                     ORDER BY created_at ASC"
                ),
                params![],
            )
            .await
            .map_err(query_err)?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            subs.push(row_to_subtask(&row)?);
        }
        Ok(subs)
    }

    async fn subtasks_to_retry(&self, job_id: Uuid) -> Result<Vec<SubTask>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM sub_tasks
                     WHERE job_id = ?1 AND status IN ('failed', 'timeout')
                     ORDER BY created_at ASC"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            subs.push(row_to_subtask(&row)?);
        }
        Ok(subs)
    }

    async fn reset_subtask_for_retry(&self, sub_task_id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE sub_tasks SET status = 'pending', retry_count = retry_count + 1,
                     error_message = NULL, completed_at = NULL, updated_at = ?2
                 WHERE sub_task_id = ?1 AND status IN ('failed', 'timeout')",
                params![sub_task_id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn cancel_active_subtasks(&self, job_id: Uuid) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE sub_tasks SET status = 'cancelled', updated_at = ?2, completed_at = ?2
                 WHERE job_id = ?1 AND status IN ('pending', 'in_progress')",
                params![job_id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }
}
