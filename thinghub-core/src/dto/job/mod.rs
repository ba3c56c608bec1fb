//! Job management DTOs

use serde::{Deserialize, Serialize};

use crate::domain::config::{RetryConfig, RolloutConfig, SchedulingConfig, TimeoutConfig};
use crate::domain::job::{JobStatus, Operation, TargetConfig};
use crate::dto::page::PageRequest;
use crate::error::ValidationError;
use crate::validation;

/// Request to create a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    /// Generated when absent
    #[serde(default)]
    pub job_id: Option<String>,
    pub operation: String,
    pub target_config: TargetConfig,
    #[serde(default)]
    pub job_doc: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheduling_config: Option<SchedulingConfig>,
    #[serde(default)]
    pub rollout_config: Option<RolloutConfig>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    #[serde(default)]
    pub timeout_config: Option<TimeoutConfig>,
}

impl CreateJobRequest {
    /// Minimal request targeting `things` with `operation`
    pub fn new(
        operation: impl Into<String>,
        things: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            job_id: None,
            operation: operation.into(),
            target_config: TargetConfig::things(things),
            job_doc: None,
            description: String::new(),
            scheduling_config: None,
            rollout_config: None,
            retry_config: None,
            timeout_config: None,
        }
    }

    /// Validates every field and returns the parsed operation
    pub fn validate(&self) -> Result<Operation, ValidationError> {
        if let Some(id) = &self.job_id {
            validation::job_id(id)?;
        }
        let op = validation::operation(&self.operation)?;
        validation::description(&self.description)?;
        validation::job_doc(&op, self.job_doc.as_ref())?;
        validation::target(&self.target_config)?;
        if let Some(c) = &self.scheduling_config {
            validation::scheduling(c)?;
        }
        if let Some(c) = &self.rollout_config {
            validation::rollout(c)?;
        }
        if let Some(c) = &self.retry_config {
            validation::retry(c)?;
        }
        if let Some(c) = &self.timeout_config {
            validation::timeout(c)?;
        }
        Ok(op)
    }
}

/// Request to update the mutable parts of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    #[serde(default)]
    pub timeout_config: Option<TimeoutConfig>,
}

impl UpdateJobRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(d) = &self.description {
            validation::description(d)?;
        }
        if let Some(c) = &self.retry_config {
            validation::retry(c)?;
        }
        if let Some(c) = &self.timeout_config {
            validation::timeout(c)?;
        }
        Ok(())
    }
}

/// Request to cancel a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelJobRequest {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub reason_code: String,
}

impl CancelJobRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::comment(&self.comment)?;
        validation::reason_code(&self.reason_code)
    }
}

/// Job listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub page: PageRequest,
}
