//! Center event loops
//!
//! - management: applies management messages on a bounded pool
//! - schedule: owns the pending job list and rolls tasks out to the runner
//! - watcher: consumes task outcomes, sweeps timeouts and finalizes jobs
//!
//! Loops share only [`Shared`]: channel senders, the repository, the runner
//! handle and the job context map.

pub(crate) mod management;
pub(crate) mod schedule;
pub(crate) mod watcher;

use std::sync::Arc;
use thinghub_core::domain::task::Task;
use thinghub_core::domain::{JobId, TaskId};
use thinghub_runner::{JobContexts, Runner};
use thinghub_store::JobRepository;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::center::PendingJobInfo;
use crate::config::CenterConfig;
use schedule::PendingJobItem;

/// Messages accepted by the schedule loop
#[derive(Debug)]
pub(crate) enum ScheduleCmd {
    Add(PendingJobItem),
    Remove(JobId),
    RemoveTask {
        job_id: JobId,
        task_id: TaskId,
    },
    PendingJobs {
        reply: oneshot::Sender<Vec<PendingJobInfo>>,
    },
    PendingTasks {
        job_id: JobId,
        reply: oneshot::Sender<Vec<Task>>,
    },
}

/// Messages accepted by the watcher loop
#[derive(Debug)]
pub(crate) enum WatchCmd {
    /// Checks the job for completion on the next check tick
    Check(JobId),
}

pub(crate) struct Shared {
    pub config: CenterConfig,
    pub repo: Arc<dyn JobRepository>,
    pub runner: Runner,
    pub contexts: JobContexts,
    pub schedule_tx: mpsc::UnboundedSender<ScheduleCmd>,
    pub watch_tx: mpsc::UnboundedSender<WatchCmd>,
}

impl Shared {
    pub fn schedule(&self, cmd: ScheduleCmd) {
        if self.schedule_tx.send(cmd).is_err() {
            debug!("Schedule loop stopped, dropping command");
        }
    }

    pub fn check(&self, job_id: &str) {
        if self.watch_tx.send(WatchCmd::Check(job_id.to_string())).is_err() {
            debug!(job_id, "Watcher stopped, dropping completion check");
        }
    }
}
