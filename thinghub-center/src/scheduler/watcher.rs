//! Task-change watcher
//!
//! Marks jobs for a completion check when their tasks finish. On each check
//! tick it times out stuck tasks and finalizes every marked job whose tasks
//! are all terminal, re-reading task statuses from the repository.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thinghub_core::domain::JobId;
use thinghub_core::domain::job::JobStatus;
use thinghub_core::domain::task::{TaskChangeMsg, TaskStatus};
use thinghub_store::{JobUpdate, StoreError};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ScheduleCmd, Shared, WatchCmd};

/// Code reported for tasks that stayed in progress past the job's timeout
pub const CODE_TIMED_OUT: i64 = 408;

/// Whether a task started at `started_at` has been running longer than `limit`
pub fn is_timed_out(
    started_at: Option<DateTime<Utc>>,
    limit: ChronoDuration,
    now: DateTime<Utc>,
) -> bool {
    started_at.is_some_and(|at| now - at > limit)
}

pub(crate) struct Watcher {
    shared: Arc<Shared>,
    checking: HashSet<JobId>,
}

impl Watcher {
    pub fn new(shared: Arc<Shared>, checking: HashSet<JobId>) -> Self {
        Self { shared, checking }
    }

    pub async fn run(
        mut self,
        mut outcomes: mpsc::UnboundedReceiver<TaskChangeMsg>,
        mut commands: mpsc::UnboundedReceiver<WatchCmd>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Starting task watcher (check interval: {:?})",
            self.shared.config.check_job_interval
        );

        let mut outcomes_open = true;
        let mut ticker = time::interval(self.shared.config.check_job_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = outcomes.recv(), if outcomes_open => match msg {
                    Some(msg) => self.on_task_change(msg),
                    None => {
                        warn!("Runner outcome stream closed");
                        outcomes_open = false;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(WatchCmd::Check(job_id)) => {
                        self.checking.insert(job_id);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep_timeouts().await;
                    self.check_jobs().await;
                }
            }
        }

        info!("Task watcher stopped");
    }

    fn on_task_change(&mut self, msg: TaskChangeMsg) {
        debug!(job_id = %msg.task.job_id, task_id = msg.task.task_id, status = %msg.status,
            "Task changed");
        if msg.status.is_terminal() {
            self.checking.insert(msg.task.job_id);
        }
    }

    /// Reports `TimedOut` for dispatched tasks older than their job's timeout
    async fn sweep_timeouts(&self) {
        let now = Utc::now();
        for ctx in self.shared.contexts.snapshot().await {
            let Some(timeout) = ctx.timeout_config else {
                continue;
            };
            if ctx.status.is_going_to_terminal() {
                continue;
            }

            let limit = ChronoDuration::minutes(i64::from(timeout.in_progress_minutes));
            let tasks = match self
                .shared
                .repo
                .tasks_of_job(&ctx.job_id, &[TaskStatus::Sent, TaskStatus::InProgress])
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(job_id = %ctx.job_id, "Failed to load in-flight tasks: {:#}", e);
                    continue;
                }
            };

            for task in tasks {
                if is_timed_out(task.started_at, limit, now) {
                    warn!(job_id = %task.job_id, task_id = task.task_id,
                        "Task in progress longer than {} minute(s), timing out", timeout.in_progress_minutes);
                    self.shared.runner.report(
                        TaskChangeMsg::new(task, TaskStatus::TimedOut)
                            .with_code(CODE_TIMED_OUT, "task timed out"),
                    );
                }
            }
        }
    }

    async fn check_jobs(&mut self) {
        for job_id in std::mem::take(&mut self.checking) {
            match self.check_finish_job(&job_id).await {
                Ok(true) => {
                    self.shared.contexts.remove(&job_id).await;
                    self.shared.schedule(ScheduleCmd::Remove(job_id));
                }
                Ok(false) => {}
                Err(StoreError::Conflict(reason)) => {
                    debug!(job_id = %job_id, "Job changed during completion check: {}", reason);
                    self.checking.insert(job_id);
                }
                Err(e) => {
                    error!(job_id = %job_id, "Completion check failed, retrying next tick: {:#}", e);
                    self.checking.insert(job_id);
                }
            }
        }
    }

    /// Finalizes the job when all its tasks are terminal, returns whether it finished
    async fn check_finish_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let counts = self.shared.repo.count_task_status(job_id).await?;
        let unfinished: u64 = counts
            .iter()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.count)
            .sum();
        if unfinished > 0 {
            debug!(job_id, "{} task(s) still unfinished", unfinished);
            return Ok(false);
        }

        let Some(job) = self.shared.repo.get_job(job_id).await? else {
            debug!(job_id, "Job already gone");
            return Ok(true);
        };

        let finish = |status| JobUpdate {
            expected_status: Some(job.status),
            ..JobUpdate::finished(status, Utc::now())
        };
        match job.status {
            JobStatus::Canceling => {
                self.shared
                    .repo
                    .update_job(job_id, finish(JobStatus::Canceled))
                    .await?;
                info!(job_id, "Job canceled");
            }
            JobStatus::Removing => match self.shared.repo.delete_job(job_id, true).await {
                Ok(_) => info!(job_id, "Job deleted"),
                Err(e) if e.is_not_found() => debug!(job_id, "Job already deleted"),
                Err(e) => return Err(e),
            },
            JobStatus::Waiting | JobStatus::InProgress => {
                self.shared
                    .repo
                    .update_job(job_id, finish(JobStatus::Completed))
                    .await?;
                info!(job_id, "Job completed");
            }
            JobStatus::Canceled => debug!(job_id, "Job already canceled"),
            JobStatus::Completed => {
                error!(job_id, status = %job.status, "Completion check on a finished job");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_needs_a_start_and_an_exceeded_limit() {
        let now = Utc::now();
        let limit = ChronoDuration::minutes(5);
        assert!(!is_timed_out(None, limit, now));
        assert!(!is_timed_out(Some(now - ChronoDuration::minutes(4)), limit, now));
        assert!(!is_timed_out(Some(now - limit), limit, now));
        assert!(is_timed_out(Some(now - ChronoDuration::minutes(6)), limit, now));
    }
}
