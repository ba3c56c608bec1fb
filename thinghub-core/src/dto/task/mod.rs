//! Task management DTOs

use serde::{Deserialize, Serialize};

use crate::domain::task::{StatusDetails, TaskStatus};
use crate::dto::page::PageRequest;

/// Request to cancel a single task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskRequest {
    /// Rejects the cancel when the stored version differs
    #[serde(default)]
    pub expected_version: Option<i32>,
    #[serde(default)]
    pub status_details: Option<StatusDetails>,
}

/// Task listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub thing_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub page: PageRequest,
}

impl TaskQuery {
    pub fn for_job(job_id: impl Into<String>, page: PageRequest) -> Self {
        Self {
            job_id: Some(job_id.into()),
            page,
            ..Default::default()
        }
    }

    pub fn for_thing(thing_id: impl Into<String>, page: PageRequest) -> Self {
        Self {
            thing_id: Some(thing_id.into()),
            page,
            ..Default::default()
        }
    }
}
