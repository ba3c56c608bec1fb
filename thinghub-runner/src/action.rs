//! Action executors
//!
//! Each executor performs one task's side effect through a collaborator and
//! turns the result into a [`TaskChangeMsg`]. Executors never fail: collaborator
//! errors become `Failed` outcomes.

use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use thinghub_core::domain::document::{InvokeMethodRequest, JobDocument, UpdateDesiredRequest};
use thinghub_core::domain::job::Operation;
use thinghub_core::domain::task::{Task, TaskChangeMsg, TaskStatus};
use tracing::{debug, error, warn};

use crate::service::{
    Collaborators, DesiredStateRequest, DesiredStateSetter, MethodInvoker, MethodRequest,
};

/// Code reported when the collaborator itself failed
pub const CODE_INTERNAL_ERROR: i64 = 500;

/// Runs the executor matching the task's operation
///
/// A document that does not fit the operation fails the task with code 500.
pub async fn execute(collaborators: &Collaborators, task: Task, doc: &JobDocument) -> TaskChangeMsg {
    match (&task.operation, doc) {
        (Operation::InvokeMethod, JobDocument::InvokeMethod(req)) => {
            invoke_method(collaborators.invoker.as_ref(), task, req).await
        }
        (Operation::UpdateDesired, JobDocument::UpdateDesired(req)) => {
            update_desired(collaborators.desired.as_ref(), task, req).await
        }
        (operation, _) => {
            error!(job_id = %task.job_id, task_id = task.task_id, %operation,
                "job document does not match the task operation");
            TaskChangeMsg::new(task, TaskStatus::Failed)
                .with_code(CODE_INTERNAL_ERROR, "job document does not match operation")
        }
    }
}

/// Invokes the job's method on the task's thing
///
/// Response codes `200` and `0` mean success, anything else fails the task.
pub async fn invoke_method(
    invoker: &dyn MethodInvoker,
    task: Task,
    req: &InvokeMethodRequest,
) -> TaskChangeMsg {
    let request = MethodRequest {
        thing_id: task.thing_id.clone(),
        method: req.method.clone(),
        response_timeout: Duration::from_secs(req.response_timeout as u64),
        client_token: client_token(&task.thing_id),
        data: req.data.clone(),
    };

    match invoker.invoke_method(request).await {
        Err(e) => {
            warn!(job_id = %task.job_id, task_id = task.task_id, thing_id = %task.thing_id,
                "invoke method failed: {:#}", e);
            TaskChangeMsg::new(task, TaskStatus::Failed).with_code(CODE_INTERNAL_ERROR, e.to_string())
        }
        Ok(resp) => {
            let status = if resp.code == 200 || resp.code == 0 {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            };
            debug!(job_id = %task.job_id, task_id = task.task_id, code = resp.code,
                "invoke method returned");
            let mut msg = TaskChangeMsg::new(task, status).with_code(resp.code, resp.message);
            msg.status_details.insert("data".to_string(), resp.data);
            msg
        }
    }
}

/// Requests the job's desired state fragment on the task's thing
pub async fn update_desired(
    setter: &dyn DesiredStateSetter,
    task: Task,
    req: &UpdateDesiredRequest,
) -> TaskChangeMsg {
    let request = DesiredStateRequest {
        client_token: client_token(&task.thing_id),
        desired: req.state.desired.clone(),
    };

    match setter.set_desired(&task.thing_id, request).await {
        Ok(()) => TaskChangeMsg::new(task, TaskStatus::Succeeded),
        Err(e) => {
            warn!(job_id = %task.job_id, task_id = task.task_id, thing_id = %task.thing_id,
                "set desired state failed: {:#}", e);
            TaskChangeMsg::new(task, TaskStatus::Failed).with_code(CODE_INTERNAL_ERROR, e.to_string())
        }
    }
}

fn client_token(thing_id: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("job-{thing_id}-{nanos}")
}

/// `code` entry of a task's status details, if numeric
pub fn details_code(msg: &TaskChangeMsg) -> Option<i64> {
    msg.status_details.get("code").and_then(Value::as_i64)
}
