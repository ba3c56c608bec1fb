//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JobId;
use super::config::{RetryConfig, RolloutConfig, SchedulingConfig, TimeoutConfig};
use super::task::{TaskStatus, TaskStatusCount};

/// Reserved operation name for remote procedure invocation
pub const OP_INVOKE_METHOD: &str = "$directMethod";

/// Reserved operation name for desired state updates
pub const OP_UPDATE_DESIRED: &str = "$updateShadow";

/// Fleet-wide operation record
///
/// Persisted by the store, projected into a [`JobContext`](super::context::JobContext)
/// by the center for scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub operation: Operation,
    pub target_config: TargetConfig,
    /// Raw job document, decoded against `operation` when scheduled
    pub job_doc: Option<serde_json::Value>,
    pub description: String,
    pub scheduling_config: Option<SchedulingConfig>,
    pub rollout_config: Option<RolloutConfig>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_config: Option<TimeoutConfig>,
    pub status: JobStatus,
    pub force_canceled: bool,
    pub comment: String,
    pub reason_code: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

/// Job lifecycle status
///
/// `Waiting -> InProgress -> {Canceling -> Canceled, Completed}`, with
/// `Removing` reachable from any state ahead of row deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    InProgress,
    Canceling,
    Canceled,
    Completed,
    Removing,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Canceled | JobStatus::Completed)
    }

    /// True once the job is ending and must not roll out new tasks
    pub fn is_going_to_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Canceling | JobStatus::Canceled | JobStatus::Removing | JobStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Canceling => "CANCELING",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Removing => "REMOVING",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(JobStatus::Waiting),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "CANCELING" => Ok(JobStatus::Canceling),
            "CANCELED" => Ok(JobStatus::Canceled),
            "COMPLETED" => Ok(JobStatus::Completed),
            "REMOVING" => Ok(JobStatus::Removing),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Action a job performs on each of its things
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    /// Invoke a remote procedure on the device
    InvokeMethod,
    /// Request a change of the device's desired state
    UpdateDesired,
    /// Caller-defined operation, opaque to the engine
    Custom(String),
}

impl Operation {
    pub fn is_system(&self) -> bool {
        !matches!(self, Operation::Custom(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::InvokeMethod => OP_INVOKE_METHOD,
            Operation::UpdateDesired => OP_UPDATE_DESIRED,
            Operation::Custom(name) => name,
        }
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        match s.as_str() {
            OP_INVOKE_METHOD => Operation::InvokeMethod,
            OP_UPDATE_DESIRED => Operation::UpdateDesired,
            _ => Operation::Custom(s),
        }
    }
}

impl From<&str> for Operation {
    fn from(s: &str) -> Self {
        Operation::from(s.to_string())
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target selector of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub things: Vec<String>,
}

impl TargetConfig {
    pub fn things(things: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            target_type: TargetType::ThingId,
            things: things.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    #[serde(rename = "THING_ID")]
    ThingId,
}

/// Aggregate task counts of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetails {
    pub queued: u64,
    pub sent: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub canceled: u64,
}

impl ProcessDetails {
    pub fn from_counts(counts: &[TaskStatusCount]) -> Self {
        let mut details = Self::default();
        for c in counts {
            let slot = match c.status {
                TaskStatus::Queued => &mut details.queued,
                TaskStatus::Sent => &mut details.sent,
                TaskStatus::InProgress => &mut details.in_progress,
                TaskStatus::Succeeded => &mut details.succeeded,
                TaskStatus::Failed => &mut details.failed,
                TaskStatus::Rejected => &mut details.rejected,
                TaskStatus::TimedOut => &mut details.timed_out,
                TaskStatus::Canceled => &mut details.canceled,
            };
            *slot += c.count;
        }
        details
    }

    pub fn total(&self) -> u64 {
        self.queued
            + self.sent
            + self.in_progress
            + self.succeeded
            + self.failed
            + self.rejected
            + self.timed_out
            + self.canceled
    }
}

/// Job record together with its task counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub process_details: ProcessDetails,
}
