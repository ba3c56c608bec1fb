//! PostgreSQL repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Postgres, Transaction};
use thinghub_core::domain::TaskId;
use thinghub_core::domain::job::{Job, JobStatus, Operation};
use thinghub_core::domain::task::{NewTask, Task, TaskStatus, TaskStatusCount};
use thinghub_core::dto::job::JobQuery;
use thinghub_core::dto::page::Page;
use thinghub_core::dto::task::TaskQuery;

use super::{JobRepository, PENDING_JOB_STATUSES, PendingJob, cancelable_statuses};
use crate::error::{Result, StoreError};
use crate::update::{JobUpdate, TaskUpdate, ensure_not_terminal};

const JOB_COLUMNS: &str = "job_id, operation, target_config, job_doc, description, \
    scheduling_config, rollout_config, retry_config, timeout_config, status, force_canceled, \
    comment, reason_code, started_at, completed_at, created_at, updated_at, version";

const TASK_COLUMNS: &str = "task_id, job_id, thing_id, operation, status, progress, \
    status_details, force_canceled, retry_attempt, queued_at, started_at, completed_at, \
    created_at, updated_at, version";

/// Repository backed by a PostgreSQL pool
///
/// Run [`crate::db::run_migrations`] before first use.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: &str) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?
            .try_into()
    }

    async fn lock_task(tx: &mut Transaction<'_, Postgres>, task_id: TaskId) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM job_task WHERE task_id = $1 FOR UPDATE"
        ))
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or(StoreError::TaskNotFound(task_id))?.try_into()
    }

    async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job
            SET description = $1, retry_config = $2, timeout_config = $3, status = $4,
                force_canceled = $5, comment = $6, reason_code = $7, started_at = $8,
                completed_at = $9, updated_at = $10, version = $11
            WHERE job_id = $12
            "#,
        )
        .bind(&job.description)
        .bind(to_json_opt(&job.retry_config)?)
        .bind(to_json_opt(&job.timeout_config)?)
        .bind(job.status.as_str())
        .bind(job.force_canceled)
        .bind(&job.comment)
        .bind(&job.reason_code)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.version)
        .bind(&job.job_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_task
            SET status = $1, progress = $2, status_details = $3, force_canceled = $4,
                retry_attempt = $5, queued_at = $6, started_at = $7, completed_at = $8,
                updated_at = $9, version = $10
            WHERE task_id = $11
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress as i16)
        .bind(serde_json::Value::Object(task.status_details.clone()))
        .bind(task.force_canceled)
        .bind(task.retry_attempt as i16)
        .bind(task.queued_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .bind(task.version)
        .bind(task.task_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgRepository {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO job ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(&job.job_id)
        .bind(job.operation.as_str())
        .bind(serde_json::to_value(&job.target_config)?)
        .bind(&job.job_doc)
        .bind(&job.description)
        .bind(to_json_opt(&job.scheduling_config)?)
        .bind(to_json_opt(&job.rollout_config)?)
        .bind(to_json_opt(&job.retry_config)?)
        .bind(to_json_opt(&job.timeout_config)?)
        .bind(job.status.as_str())
        .bind(job.force_canceled)
        .bind(&job.comment)
        .bind(&job.reason_code)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicated(job.job_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        update.apply(&mut job, Utc::now())?;
        Self::write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn delete_job(&self, job_id: &str, force: bool) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        if !force && job.status == JobStatus::InProgress {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is in progress, delete requires force"
            )));
        }
        sqlx::query("DELETE FROM job WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Page<Job>> {
        let status = query.status.map(|s| s.as_str());
        let operation = query.operation.as_ref().map(|op| op.as_str().to_string());
        let filter = "($1::text IS NULL OR status = $1) AND ($2::text IS NULL OR operation = $2)";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM job WHERE {filter}"))
            .bind(status)
            .bind(&operation)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE {filter} \
             ORDER BY created_at DESC, job_id ASC LIMIT $3 OFFSET $4"
        ))
        .bind(status)
        .bind(&operation)
        .bind(query.page.limit() as i64)
        .bind(query.page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.into_iter().map(Job::try_from).collect::<Result<_>>()?,
            total: total as u64,
            page_index: query.page.page_index,
            page_size: query.page.limit(),
        })
    }

    async fn create_tasks(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(tasks.len());
        for new in tasks {
            let result = sqlx::query_as::<_, TaskRow>(&format!(
                "INSERT INTO job_task (job_id, thing_id, operation, status, queued_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $5, $5) RETURNING {TASK_COLUMNS}"
            ))
            .bind(&new.job_id)
            .bind(&new.thing_id)
            .bind(new.operation.as_str())
            .bind(TaskStatus::Queued.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await;
            let row = match result {
                Ok(row) => row,
                Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                    return Err(StoreError::JobNotFound(new.job_id));
                }
                Err(e) => return Err(e.into()),
            };
            created.push(Task::try_from(row)?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let mut task = Self::lock_task(&mut tx, task_id).await?;
        update.apply(&mut task, Utc::now())?;
        Self::write_task(&mut tx, &task).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn transition_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let mut task = Self::lock_task(&mut tx, task_id).await?;
        ensure_not_terminal(&task)?;
        update.apply(&mut task, Utc::now())?;
        Self::write_task(&mut tx, &task).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "DELETE FROM job_task WHERE task_id = $1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::TaskNotFound(task_id))?.try_into()
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM job_task WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from).transpose()
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Page<Task>> {
        let status = query.status.map(|s| s.as_str());
        let filter = "($1::text IS NULL OR job_id = $1) \
            AND ($2::text IS NULL OR thing_id = $2) \
            AND ($3::text IS NULL OR status = $3)";

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM job_task WHERE {filter}"))
                .bind(&query.job_id)
                .bind(&query.thing_id)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM job_task WHERE {filter} \
             ORDER BY task_id ASC LIMIT $4 OFFSET $5"
        ))
        .bind(&query.job_id)
        .bind(&query.thing_id)
        .bind(status)
        .bind(query.page.limit() as i64)
        .bind(query.page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.into_iter().map(Task::try_from).collect::<Result<_>>()?,
            total: total as u64,
            page_index: query.page.page_index,
            page_size: query.page.limit(),
        })
    }

    async fn tasks_of_job(&self, job_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM job_task \
             WHERE job_id = $1 AND (cardinality($2::text[]) = 0 OR status = ANY($2)) \
             ORDER BY task_id ASC"
        ))
        .bind(job_id)
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn count_task_status(&self, job_id: &str) -> Result<Vec<TaskStatusCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM job_task WHERE job_id = $1 GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(status, count)| -> Result<TaskStatusCount> {
                Ok(TaskStatusCount {
                    status: status.parse().map_err(StoreError::CorruptRow)?,
                    count: count as u64,
                })
            })
            .collect()
    }

    async fn get_pending_jobs(&self) -> Result<Vec<PendingJob>> {
        let pending: Vec<String> = PENDING_JOB_STATUSES
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE status = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(pending)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = Job::try_from(row)?;
            let tasks = self
                .tasks_of_job(&job.job_id, &TaskStatus::NON_TERMINAL)
                .await?;
            jobs.push(PendingJob { job, tasks });
        }
        Ok(jobs)
    }

    async fn cancel_tasks(&self, job_id: &str, force: bool) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE job_task
            SET status = $1, force_canceled = $2, completed_at = $3, updated_at = $3,
                version = version + 1
            WHERE job_id = $4 AND status = ANY($5)
            "#,
        )
        .bind(TaskStatus::Canceled.as_str())
        .bind(force)
        .bind(now)
        .bind(job_id)
        .bind(status_names(cancelable_statuses(force)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_names(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>> {
    Ok(value.as_ref().map(serde_json::to_value).transpose()?)
}

fn from_json_opt<T: DeserializeOwned>(value: Option<serde_json::Value>) -> Result<Option<T>> {
    Ok(value.map(serde_json::from_value).transpose()?)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    operation: String,
    target_config: serde_json::Value,
    job_doc: Option<serde_json::Value>,
    description: String,
    scheduling_config: Option<serde_json::Value>,
    rollout_config: Option<serde_json::Value>,
    retry_config: Option<serde_json::Value>,
    timeout_config: Option<serde_json::Value>,
    status: String,
    force_canceled: bool,
    comment: String,
    reason_code: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i32,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            job_id: row.job_id,
            operation: Operation::from(row.operation),
            target_config: serde_json::from_value(row.target_config)?,
            job_doc: row.job_doc,
            description: row.description,
            scheduling_config: from_json_opt(row.scheduling_config)?,
            rollout_config: from_json_opt(row.rollout_config)?,
            retry_config: from_json_opt(row.retry_config)?,
            timeout_config: from_json_opt(row.timeout_config)?,
            status: row.status.parse().map_err(StoreError::CorruptRow)?,
            force_canceled: row.force_canceled,
            comment: row.comment,
            reason_code: row.reason_code,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: i64,
    job_id: String,
    thing_id: String,
    operation: String,
    status: String,
    progress: i16,
    status_details: serde_json::Value,
    force_canceled: bool,
    retry_attempt: i16,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i32,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let status_details = match row.status_details {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Default::default(),
            other => {
                return Err(StoreError::CorruptRow(format!(
                    "task {} status_details is not an object: {other}",
                    row.task_id
                )));
            }
        };
        Ok(Task {
            task_id: row.task_id,
            job_id: row.job_id,
            thing_id: row.thing_id,
            operation: Operation::from(row.operation),
            status: row.status.parse().map_err(StoreError::CorruptRow)?,
            progress: row.progress.clamp(0, 100) as u8,
            status_details,
            force_canceled: row.force_canceled,
            retry_attempt: row.retry_attempt.clamp(0, u8::MAX as i16) as u8,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}
