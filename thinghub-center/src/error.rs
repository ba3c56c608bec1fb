//! Center error types

use thinghub_core::ValidationError;
use thinghub_runner::RunnerError;
use thinghub_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CenterError {
    #[error("center already started")]
    AlreadyStarted,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("failed to load pending jobs: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned by [`JobService`](crate::service::JobService)
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i32, actual: i32 },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => ServiceError::NotFound(format!("job {id}")),
            StoreError::TaskNotFound(id) => ServiceError::NotFound(format!("task {id}")),
            StoreError::Duplicated(id) => {
                ServiceError::InvalidState(format!("job {id} already exists"))
            }
            StoreError::Conflict(reason) => ServiceError::InvalidState(reason),
            StoreError::TaskTerminal { task_id, status } => {
                ServiceError::InvalidState(format!("task {task_id} is already {status}"))
            }
            StoreError::VersionConflict { expected, actual } => {
                ServiceError::VersionConflict { expected, actual }
            }
            other => ServiceError::Store(other),
        }
    }
}
