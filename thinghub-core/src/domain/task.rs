//! Task domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::job::Operation;
use super::{JobId, TaskId, ThingId};

/// Free-form outcome details (`code`, `message`, `data`)
pub type StatusDetails = serde_json::Map<String, serde_json::Value>;

/// One job applied to one thing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub thing_id: ThingId,
    pub operation: Operation,
    pub status: TaskStatus,
    pub progress: u8,
    pub status_details: StatusDetails,
    pub force_canceled: bool,
    pub retry_attempt: u8,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

/// Task row before storage assigns its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub job_id: JobId,
    pub thing_id: ThingId,
    pub operation: Operation,
}

/// Task lifecycle status
///
/// `Queued -> Sent -> InProgress -> {Succeeded, Failed, Rejected, TimedOut, Canceled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Sent,
    InProgress,
    Succeeded,
    Failed,
    Rejected,
    TimedOut,
    Canceled,
}

impl TaskStatus {
    pub const NON_TERMINAL: [TaskStatus; 3] =
        [TaskStatus::Queued, TaskStatus::Sent, TaskStatus::InProgress];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::Rejected
                | TaskStatus::TimedOut
                | TaskStatus::Canceled
        )
    }

    /// Dispatched to the device but not finished
    pub fn is_ongoing(self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::InProgress)
    }

    /// Queue priority, higher runs first
    pub fn priority(self) -> u8 {
        match self {
            TaskStatus::InProgress => 3,
            TaskStatus::Sent => 2,
            TaskStatus::Queued => 1,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Sent => "SENT",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Rejected => "REJECTED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "SENT" => Ok(TaskStatus::Sent),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "REJECTED" => Ok(TaskStatus::Rejected),
            "TIMED_OUT" => Ok(TaskStatus::TimedOut),
            "CANCELED" => Ok(TaskStatus::Canceled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Number of tasks of a job in one status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusCount {
    pub status: TaskStatus,
    pub count: u64,
}

/// Proposed new state of a task
///
/// Produced by the runner (or a device report), persisted by the runner's
/// outcome loop and consumed by the center.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskChangeMsg {
    pub task: Task,
    pub status: TaskStatus,
    pub progress: u8,
    pub status_details: StatusDetails,
}

impl TaskChangeMsg {
    pub fn new(task: Task, status: TaskStatus) -> Self {
        let progress = if status.is_terminal() { 100 } else { task.progress };
        Self {
            task,
            status,
            progress,
            status_details: StatusDetails::new(),
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_details(mut self, details: StatusDetails) -> Self {
        self.status_details = details;
        self
    }

    /// Builds `{"code": .., "message": ..}` details
    pub fn with_code(mut self, code: i64, message: impl Into<String>) -> Self {
        self.status_details
            .insert("code".to_string(), serde_json::Value::from(code));
        self.status_details
            .insert("message".to_string(), serde_json::Value::String(message.into()));
        self
    }
}
