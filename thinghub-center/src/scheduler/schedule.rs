//! Schedule loop
//!
//! Owns the pending job list. On every tick each pending job is checked
//! against its schedule window, promoted to `InProgress` on first rollout and
//! rolled out to the runner within its rate limit.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thinghub_core::domain::config::EndBehavior;
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::job::JobStatus;
use thinghub_core::domain::task::Task;
use thinghub_store::{JobUpdate, StoreError};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ScheduleCmd, Shared};
use crate::center::PendingJobInfo;

/// Trailing window of the rollout rate limit
pub const ROLLOUT_WINDOW: Duration = Duration::from_secs(60);

/// A job with tasks not yet handed to the runner
#[derive(Debug)]
pub(crate) struct PendingJobItem {
    pub context: JobContext,
    pub tasks: Vec<Task>,
    /// `(rolled out at, count)` within the trailing window
    pub rollout_stat: Vec<(Instant, usize)>,
}

impl PendingJobItem {
    pub fn new(context: JobContext, mut tasks: Vec<Task>) -> Self {
        tasks.sort_by_key(|t| (Reverse(t.status.priority()), t.created_at, t.task_id));
        Self {
            context,
            tasks,
            rollout_stat: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.context.job_id
    }
}

/// Tasks that may be rolled out now without exceeding `max_per_minute`
/// in the trailing window
pub fn next_rollout_count(
    max_per_minute: u32,
    stat: &[(Instant, usize)],
    remaining: usize,
    now: Instant,
) -> usize {
    let used: usize = stat
        .iter()
        .filter(|(at, _)| now.saturating_duration_since(*at) < ROLLOUT_WINDOW)
        .map(|(_, count)| count)
        .sum();
    (max_per_minute as usize).saturating_sub(used).min(remaining)
}

pub(crate) struct ScheduleLoop {
    shared: Arc<Shared>,
    items: Vec<PendingJobItem>,
}

impl ScheduleLoop {
    pub fn new(shared: Arc<Shared>, items: Vec<PendingJobItem>) -> Self {
        Self { shared, items }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ScheduleCmd>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Starting schedule loop with {} pending job(s) (interval: {:?})",
            self.items.len(),
            self.shared.config.schedule_interval
        );

        let mut ticker = time::interval(self.shared.config.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("Schedule loop stopped with {} pending job(s)", self.items.len());
    }

    fn handle(&mut self, cmd: ScheduleCmd) {
        match cmd {
            ScheduleCmd::Add(item) => {
                debug!(job_id = %item.job_id(), "Scheduling {} task(s)", item.tasks.len());
                self.items.retain(|i| i.job_id() != item.job_id());
                self.items.push(item);
            }
            ScheduleCmd::Remove(job_id) => {
                let before = self.items.len();
                self.items.retain(|i| i.job_id() != job_id);
                if self.items.len() < before {
                    debug!(job_id = %job_id, "Evicted pending job");
                }
            }
            ScheduleCmd::RemoveTask { job_id, task_id } => {
                if let Some(item) = self.items.iter_mut().find(|i| i.job_id() == job_id) {
                    item.tasks.retain(|t| t.task_id != task_id);
                }
            }
            ScheduleCmd::PendingJobs { reply } => {
                let jobs = self
                    .items
                    .iter()
                    .map(|i| PendingJobInfo {
                        job_id: i.context.job_id.clone(),
                        operation: i.context.operation.clone(),
                        status: i.context.status,
                        pending_tasks: i.tasks.len(),
                    })
                    .collect();
                let _ = reply.send(jobs);
            }
            ScheduleCmd::PendingTasks { job_id, reply } => {
                let tasks = self
                    .items
                    .iter()
                    .find(|i| i.job_id() == job_id)
                    .map(|i| i.tasks.clone())
                    .unwrap_or_default();
                let _ = reply.send(tasks);
            }
        }
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        let items = std::mem::take(&mut self.items);
        for mut item in items {
            if self.step(&mut item, now).await {
                self.items.push(item);
            }
        }
    }

    /// Advances one pending job, returns whether it stays pending
    async fn step(&self, item: &mut PendingJobItem, now: DateTime<Utc>) -> bool {
        let Some(ctx) = self.shared.contexts.get(item.job_id()).await else {
            error!(job_id = %item.job_id(), "Pending job has no context, dropping it");
            return false;
        };
        item.context = ctx.clone();

        if ctx.status.is_going_to_terminal() {
            item.tasks.retain(|t| t.status.is_ongoing());
        }

        if let Some(window) = &ctx.scheduling_config {
            if window.is_before_start(now) {
                return true;
            }
            if window.is_after_end(now) {
                self.close_window(&ctx, window.end_behavior, now).await;
                return false;
            }
        }

        self.roll_out(item, &ctx, now).await
    }

    async fn roll_out(&self, item: &mut PendingJobItem, ctx: &JobContext, now: DateTime<Utc>) -> bool {
        if ctx.status == JobStatus::Waiting {
            match self
                .shared
                .repo
                .update_job(&ctx.job_id, JobUpdate::start_waiting(now))
                .await
            {
                Ok(job) => {
                    info!(job_id = %ctx.job_id, "Job started");
                    self.shared
                        .contexts
                        .update(&ctx.job_id, |c| {
                            if c.status == JobStatus::Waiting {
                                c.status = JobStatus::InProgress;
                                c.started_at = job.started_at;
                            }
                        })
                        .await;
                    item.context.status = JobStatus::InProgress;
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(job_id = %ctx.job_id, "Job left Waiting before rollout: {}", reason);
                    return true;
                }
                Err(e) => {
                    error!(job_id = %ctx.job_id, "Failed to start job: {:#}", e);
                    return true;
                }
            }
        }

        let instant = Instant::now();
        item.rollout_stat
            .retain(|(at, _)| instant.saturating_duration_since(*at) < ROLLOUT_WINDOW);

        let count = match ctx.rollout_config {
            Some(rollout) => next_rollout_count(
                rollout.max_per_minute,
                &item.rollout_stat,
                item.tasks.len(),
                instant,
            ),
            None => item.tasks.len(),
        };

        if count > 0 {
            let batch: Vec<Task> = item.tasks.drain(..count).collect();
            info!(job_id = %ctx.job_id, "Rolled out {} task(s), {} remaining", count, item.tasks.len());
            self.shared.runner.put_tasks(&ctx.operation, batch);
            item.rollout_stat.push((instant, count));
        }

        !item.tasks.is_empty()
    }

    /// Applies the end-of-window behaviour, the item is dropped afterwards
    async fn close_window(&self, ctx: &JobContext, behavior: EndBehavior, now: DateTime<Utc>) {
        let job_id = &ctx.job_id;

        if ctx.status == JobStatus::Waiting {
            warn!(job_id = %job_id, "Schedule window closed before the job started");
            self.end_job(ctx, JobStatus::Canceling, false, now).await;
            return;
        }
        if ctx.status.is_going_to_terminal() {
            return;
        }

        info!(job_id = %job_id, ?behavior, "Schedule window closed");
        match behavior {
            EndBehavior::StopRollout => {
                self.shared.runner.cancel_tasks_of_job(job_id);
                match self.shared.repo.cancel_tasks(job_id, false).await {
                    Ok(n) => debug!(job_id = %job_id, "Dropped {} unrolled task(s)", n),
                    Err(e) => error!(job_id = %job_id, "Failed to drop unrolled tasks: {:#}", e),
                }
                self.shared.check(job_id);
            }
            EndBehavior::Cancel => self.end_job(ctx, JobStatus::Canceling, false, now).await,
            EndBehavior::ForceCancel => self.end_job(ctx, JobStatus::Canceled, true, now).await,
        }
    }

    /// Moves the job to `status` unless it changed since `ctx` was read
    async fn end_job(&self, ctx: &JobContext, status: JobStatus, force: bool, now: DateTime<Utc>) {
        let job_id = &ctx.job_id;
        let base = if status.is_terminal() {
            JobUpdate::finished(status, now)
        } else {
            JobUpdate::status(status)
        };
        let update = JobUpdate {
            force_canceled: Some(force),
            expected_status: Some(ctx.status),
            ..base
        };
        match self.shared.repo.update_job(job_id, update).await {
            Ok(_) => {}
            Err(StoreError::Conflict(reason)) => {
                debug!(job_id = %job_id, "Job changed before its window closed: {}", reason);
                return;
            }
            Err(e) => error!(job_id = %job_id, %status, "Failed to persist job status: {:#}", e),
        }

        self.shared
            .contexts
            .update(job_id, |c| {
                c.status = status;
                c.force_canceled = force;
            })
            .await;
        self.shared.runner.cancel_tasks_of_job(job_id);

        if let Err(e) = self.shared.repo.cancel_tasks(job_id, force).await {
            error!(job_id = %job_id, "Failed to cancel tasks: {:#}", e);
        }
        self.shared.check(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_count_without_history() {
        let now = Instant::now();
        assert_eq!(next_rollout_count(5, &[], 3, now), 3);
        assert_eq!(next_rollout_count(5, &[], 10, now), 5);
        assert_eq!(next_rollout_count(1, &[], 0, now), 0);
    }

    #[test]
    fn test_rollout_count_respects_trailing_window() {
        let now = Instant::now() + Duration::from_secs(120);
        let stat = vec![
            (now - Duration::from_secs(90), 4),
            (now - Duration::from_secs(30), 2),
            (now - Duration::from_secs(5), 1),
        ];
        assert_eq!(next_rollout_count(5, &stat, 10, now), 2);
        assert_eq!(next_rollout_count(3, &stat, 10, now), 0);
        assert_eq!(next_rollout_count(2, &stat, 10, now), 0);
    }

    #[test]
    fn test_pending_item_orders_in_flight_tasks_first() {
        use thinghub_core::domain::task::TaskStatus;
        use thinghub_runner::testing::{context, task};

        let mut sent = task(3, "j1", "d3");
        sent.status = TaskStatus::Sent;
        let item = PendingJobItem::new(
            context("j1"),
            vec![task(1, "j1", "d1"), task(2, "j1", "d2"), sent],
        );
        let ids: Vec<_> = item.tasks.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }
}
