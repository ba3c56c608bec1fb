//! In-memory scheduling projection of a job

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::JobId;
use super::config::{RetryConfig, RolloutConfig, SchedulingConfig, TimeoutConfig};
use super::document::JobDocument;
use super::job::{Job, JobStatus, Operation};

/// The subset of a job consulted on the scheduling and dispatch hot path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    pub job_id: JobId,
    pub operation: Operation,
    pub job_doc: JobDocument,
    pub scheduling_config: Option<SchedulingConfig>,
    pub rollout_config: Option<RolloutConfig>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_config: Option<TimeoutConfig>,
    pub status: JobStatus,
    pub force_canceled: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobContext {
    /// Projects a stored job, decoding its document against its operation
    pub fn from_job(job: &Job) -> Result<Self, serde_json::Error> {
        let job_doc = JobDocument::decode(&job.operation, job.job_doc.as_ref())?;
        Ok(Self {
            job_id: job.job_id.clone(),
            operation: job.operation.clone(),
            job_doc,
            scheduling_config: job.scheduling_config.clone(),
            rollout_config: job.rollout_config,
            retry_config: job.retry_config.clone(),
            timeout_config: job.timeout_config,
            status: job.status,
            force_canceled: job.force_canceled,
            started_at: job.started_at,
        })
    }
}
