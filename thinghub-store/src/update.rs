//! Typed partial updates
//!
//! Updates carry no identity fields, so job, task and thing ids can never be
//! rewritten through the repository. Both backends apply updates through the
//! same `apply` functions.

use chrono::{DateTime, Utc};
use thinghub_core::domain::config::{RetryConfig, TimeoutConfig};
use thinghub_core::domain::job::{Job, JobStatus};
use thinghub_core::domain::task::{StatusDetails, Task, TaskChangeMsg, TaskStatus};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub description: Option<String>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_config: Option<TimeoutConfig>,
    pub force_canceled: Option<bool>,
    pub comment: Option<String>,
    pub reason_code: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Applies only while the stored job is in this status
    pub expected_status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// `InProgress` with a start timestamp
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::InProgress),
            started_at: Some(at),
            ..Default::default()
        }
    }

    /// Final status with a completion timestamp
    pub fn finished(status: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(at),
            ..Default::default()
        }
    }

    /// Promotes a `Waiting` job, failing with `Conflict` once it left `Waiting`
    pub fn start_waiting(at: DateTime<Utc>) -> Self {
        Self {
            expected_status: Some(JobStatus::Waiting),
            ..Self::started(at)
        }
    }

    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) -> Result<()> {
        if let Some(expected) = self.expected_status {
            if job.status != expected {
                return Err(StoreError::Conflict(format!(
                    "job {} is {}, expected {}",
                    job.job_id, job.status, expected
                )));
            }
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(retry) = &self.retry_config {
            job.retry_config = Some(retry.clone());
        }
        if let Some(timeout) = self.timeout_config {
            job.timeout_config = Some(timeout);
        }
        if let Some(force) = self.force_canceled {
            job.force_canceled = force;
        }
        if let Some(comment) = &self.comment {
            job.comment = comment.clone();
        }
        if let Some(reason_code) = &self.reason_code {
            job.reason_code = reason_code.clone();
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        job.updated_at = now;
        job.version += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub status_details: Option<StatusDetails>,
    pub force_canceled: Option<bool>,
    pub retry_attempt: Option<u8>,
    /// Optimistic lock, checked before anything is written
    pub expected_version: Option<i32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn from_change(msg: &TaskChangeMsg) -> Self {
        Self {
            status: Some(msg.status),
            progress: Some(msg.progress),
            status_details: (!msg.status_details.is_empty()).then(|| msg.status_details.clone()),
            ..Default::default()
        }
    }

    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
        if let Some(expected) = self.expected_version {
            if expected != task.version {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: task.version,
                });
            }
        }
        if let Some(status) = self.status {
            task.status = status;
            match status {
                TaskStatus::Queued => {
                    task.queued_at = now;
                    task.started_at = None;
                    task.completed_at = None;
                }
                s if s.is_ongoing() => {
                    if task.started_at.is_none() {
                        task.started_at = Some(now);
                    }
                }
                _ => task.completed_at = Some(now),
            }
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(details) = &self.status_details {
            task.status_details = details.clone();
        }
        if let Some(force) = self.force_canceled {
            task.force_canceled = force;
        }
        if let Some(attempt) = self.retry_attempt {
            task.retry_attempt = attempt;
        }
        task.updated_at = now;
        task.version += 1;
        Ok(())
    }
}

/// Rejects writes to tasks that already finished
pub fn ensure_not_terminal(task: &Task) -> Result<()> {
    if task.status.is_terminal() {
        Err(StoreError::TaskTerminal {
            task_id: task.task_id,
            status: task.status,
        })
    } else {
        Ok(())
    }
}
