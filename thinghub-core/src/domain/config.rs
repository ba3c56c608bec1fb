//! Optional per-job scheduling configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Time window in which a job may roll out tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_behavior: EndBehavior,
}

impl SchedulingConfig {
    pub fn is_before_start(&self, now: DateTime<Utc>) -> bool {
        now < self.start_time
    }

    pub fn is_after_end(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| now > end)
    }
}

/// What happens to a job when its scheduling window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndBehavior {
    /// Stop rolling out, let dispatched tasks finish
    StopRollout,
    /// Cancel queued tasks, let dispatched tasks finish
    Cancel,
    /// Cancel every unfinished task
    ForceCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutConfig {
    /// Max tasks started per trailing 60 second window
    pub max_per_minute: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub criteria_list: Vec<RetryCriteria>,
}

impl RetryConfig {
    /// Number of retries configured for a failure status, zero when none apply
    pub fn retries_for(&self, status: TaskStatus) -> u8 {
        self.criteria_list
            .iter()
            .filter(|c| c.failure_type.covers(status))
            .map(|c| c.number_of_retries)
            .max()
            .unwrap_or(0)
    }

    /// Whether a task ending in `status` after `attempt` retries gets another run
    pub fn should_retry(&self, status: TaskStatus, attempt: u8) -> bool {
        attempt < self.retries_for(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCriteria {
    pub failure_type: FailureType,
    pub number_of_retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Failed,
    TimedOut,
    All,
}

impl FailureType {
    pub fn covers(self, status: TaskStatus) -> bool {
        match self {
            FailureType::Failed => status == TaskStatus::Failed,
            FailureType::TimedOut => status == TaskStatus::TimedOut,
            FailureType::All => matches!(status, TaskStatus::Failed | TaskStatus::TimedOut),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Max minutes a task may stay dispatched
    pub in_progress_minutes: u32,
}
