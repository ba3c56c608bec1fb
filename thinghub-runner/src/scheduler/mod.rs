//! Runner event loops
//!
//! The dispatch loop owns the task queues and the offline deferral map, the
//! outcome loop persists outcomes and forwards them to the center. Both are
//! reached only through channels.

pub(crate) mod dispatch;
pub(crate) mod outcome;

use thinghub_core::domain::job::Operation;
use thinghub_core::domain::task::Task;
use thinghub_core::domain::{JobId, TaskId};
use tokio::sync::oneshot;

/// Messages accepted by the dispatch loop
#[derive(Debug)]
pub(crate) enum DispatchCmd {
    Put(Vec<Task>),
    /// Drops tasks by id from every queue and the offline map
    Remove(Vec<TaskId>),
    /// Drops every task of a job
    RemoveJob(JobId),
    PendingSys {
        operation: Operation,
        reply: oneshot::Sender<Vec<Task>>,
    },
    PendingCustom {
        reply: oneshot::Sender<Vec<Task>>,
    },
}
