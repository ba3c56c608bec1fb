//! Management messages
//!
//! Written durably by the management service first, then posted to the
//! center which applies their in-memory effect asynchronously.

use thinghub_core::domain::config::{RetryConfig, TimeoutConfig};
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::task::NewTask;
use thinghub_core::domain::TaskId;

#[derive(Debug, Clone)]
pub enum MgrMsg {
    /// Inserts the tasks and starts scheduling the job
    CreateJob {
        context: JobContext,
        tasks: Vec<NewTask>,
    },
    /// Merges new retry and timeout settings into the live context
    UpdateJob {
        job_id: String,
        retry_config: Option<RetryConfig>,
        timeout_config: Option<TimeoutConfig>,
    },
    CancelJob {
        job_id: String,
        force: bool,
    },
    DeleteJob {
        job_id: String,
        force: bool,
    },
    CancelTask {
        job_id: String,
        task_id: TaskId,
    },
    DeleteTask {
        job_id: String,
        task_id: TaskId,
    },
}

impl MgrMsg {
    pub fn job_id(&self) -> &str {
        match self {
            MgrMsg::CreateJob { context, .. } => &context.job_id,
            MgrMsg::UpdateJob { job_id, .. }
            | MgrMsg::CancelJob { job_id, .. }
            | MgrMsg::DeleteJob { job_id, .. }
            | MgrMsg::CancelTask { job_id, .. }
            | MgrMsg::DeleteTask { job_id, .. } => job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MgrMsg::CreateJob { .. } => "create job",
            MgrMsg::UpdateJob { .. } => "update job",
            MgrMsg::CancelJob { .. } => "cancel job",
            MgrMsg::DeleteJob { .. } => "delete job",
            MgrMsg::CancelTask { .. } => "cancel task",
            MgrMsg::DeleteTask { .. } => "delete task",
        }
    }
}
