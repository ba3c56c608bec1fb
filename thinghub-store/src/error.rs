//! Store error type

use thiserror::Error;
use thinghub_core::domain::TaskId;
use thinghub_core::domain::task::TaskStatus;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("job {0} already exists")]
    Duplicated(String),

    /// The record is in a state that forbids the write
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i32, actual: i32 },

    /// A guarded task write found the task already finished
    #[error("task {task_id} is already terminal at status {status}")]
    TaskTerminal { task_id: TaskId, status: TaskStatus },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::TaskNotFound(_))
    }

    /// Write lost against a concurrent change, safe to discard
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::TaskTerminal { .. } | Self::VersionConflict { .. })
    }
}
