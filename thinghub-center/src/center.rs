//! Center handle
//!
//! An explicitly constructed engine instance with a `start`/`stop` lifecycle.
//! Management messages are fire-and-forget; introspection round-trips through
//! the schedule loop and times out to an empty result.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::job::{JobStatus, Operation};
use thinghub_core::domain::task::Task;
use thinghub_core::domain::JobId;
use thinghub_runner::{Collaborators, JobContexts, Runner};
use thinghub_store::JobRepository;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CenterConfig;
use crate::error::CenterError;
use crate::message::MgrMsg;
use crate::scheduler::schedule::{PendingJobItem, ScheduleLoop};
use crate::scheduler::watcher::Watcher;
use crate::scheduler::{ScheduleCmd, Shared, WatchCmd, management};

/// Summary of a job still holding tasks to roll out
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobInfo {
    pub job_id: JobId,
    pub operation: Operation,
    pub status: JobStatus,
    pub pending_tasks: usize,
}

struct Inboxes {
    mgr: mpsc::UnboundedReceiver<MgrMsg>,
    schedule: mpsc::UnboundedReceiver<ScheduleCmd>,
    watch: mpsc::UnboundedReceiver<WatchCmd>,
}

pub struct Center {
    shared: Arc<Shared>,
    mgr_tx: mpsc::UnboundedSender<MgrMsg>,
    shutdown: CancellationToken,
    inboxes: Mutex<Option<Inboxes>>,
}

impl Center {
    pub fn new(
        config: CenterConfig,
        repo: Arc<dyn JobRepository>,
        collaborators: Collaborators,
    ) -> Self {
        let (mgr_tx, mgr) = mpsc::unbounded_channel();
        let (schedule_tx, schedule) = mpsc::unbounded_channel();
        let (watch_tx, watch) = mpsc::unbounded_channel();
        let runner = Runner::new(config.runner.clone(), repo.clone(), collaborators);

        let shared = Arc::new(Shared {
            config,
            repo,
            runner,
            contexts: JobContexts::new(),
            schedule_tx,
            watch_tx,
        });

        Self {
            shared,
            mgr_tx,
            shutdown: CancellationToken::new(),
            inboxes: Mutex::new(Some(Inboxes {
                mgr,
                schedule,
                watch,
            })),
        }
    }

    /// Starts the runner and the center loops after preloading pending jobs
    ///
    /// Fails with [`CenterError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> Result<(), CenterError> {
        let inboxes = self
            .inboxes
            .lock()
            .await
            .take()
            .ok_or(CenterError::AlreadyStarted)?;

        let outcomes = self
            .shared
            .runner
            .start(self.shared.contexts.clone(), self.shutdown.child_token())
            .await?;

        let (items, checking) = match self.preload().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.shutdown.cancel();
                return Err(e);
            }
        };

        tokio::spawn(Watcher::new(self.shared.clone(), checking).run(
            outcomes,
            inboxes.watch,
            self.shutdown.child_token(),
        ));
        tokio::spawn(
            ScheduleLoop::new(self.shared.clone(), items)
                .run(inboxes.schedule, self.shutdown.child_token()),
        );
        tokio::spawn(management::run(
            self.shared.clone(),
            inboxes.mgr,
            self.shutdown.child_token(),
        ));

        info!("Center started");
        Ok(())
    }

    /// Loads non-terminal jobs with their unfinished tasks
    ///
    /// Jobs already ending are also queued for a completion check.
    async fn preload(&self) -> Result<(Vec<PendingJobItem>, HashSet<JobId>), CenterError> {
        let pending = self.shared.repo.get_pending_jobs().await?;
        let mut items = Vec::with_capacity(pending.len());
        let mut checking = HashSet::new();

        for p in pending {
            let ctx = match JobContext::from_job(&p.job) {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(job_id = %p.job.job_id, "Skipping job with undecodable document: {}", e);
                    continue;
                }
            };
            let mut tasks = p.tasks;
            if ctx.status.is_going_to_terminal() {
                tasks = self.settle_ending(&ctx, tasks).await;
            }
            if ctx.status.is_going_to_terminal() || tasks.is_empty() {
                checking.insert(ctx.job_id.clone());
            }
            self.shared.contexts.set(ctx.clone()).await;
            items.push(PendingJobItem::new(ctx, tasks));
        }

        info!(
            "Loaded {} pending job(s) with {} task(s)",
            items.len(),
            items.iter().map(|i| i.tasks.len()).sum::<usize>()
        );
        Ok((items, checking))
    }

    /// Cancels the tasks an ending job must not run after a restart
    ///
    /// A gracefully canceling job keeps its dispatched tasks, they are rolled
    /// out again and finish. Every other ending job has all its open tasks
    /// canceled. Returns the tasks left to roll out.
    async fn settle_ending(&self, ctx: &JobContext, tasks: Vec<Task>) -> Vec<Task> {
        let force = ctx.status != JobStatus::Canceling || ctx.force_canceled;
        match self.shared.repo.cancel_tasks(&ctx.job_id, force).await {
            Ok(n) => debug!(job_id = %ctx.job_id, status = %ctx.status, "Canceled {} task(s) of ending job", n),
            Err(e) => error!(job_id = %ctx.job_id, "Failed to cancel tasks of ending job: {:#}", e),
        }
        if force {
            Vec::new()
        } else {
            tasks.into_iter().filter(|t| t.status.is_ongoing()).collect()
        }
    }

    /// Stops every loop of the center and its runner
    pub fn stop(&self) {
        info!("Stopping center");
        self.shutdown.cancel();
    }

    /// Posts a management message, applied asynchronously
    pub fn receive_mgr_msg(&self, msg: MgrMsg) {
        debug!(job_id = %msg.job_id(), "Received {}", msg.kind());
        if self.mgr_tx.send(msg).is_err() {
            warn!("Management loop stopped, dropping message");
        }
    }

    pub async fn get_pending_jobs(&self) -> Vec<PendingJobInfo> {
        self.query(|reply| ScheduleCmd::PendingJobs { reply }).await
    }

    /// Tasks of a job not yet handed to the runner
    pub async fn get_pending_tasks(&self, job_id: &str) -> Vec<Task> {
        let job_id = job_id.to_string();
        self.query(|reply| ScheduleCmd::PendingTasks { job_id, reply })
            .await
    }

    /// The runner launched by this center
    pub fn runner(&self) -> &Runner {
        &self.shared.runner
    }

    pub fn contexts(&self) -> &JobContexts {
        &self.shared.contexts
    }

    async fn query<T: Default>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ScheduleCmd) -> T {
        let (reply, rx) = oneshot::channel();
        self.shared.schedule(build(reply));
        match tokio::time::timeout(self.shared.config.query_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => T::default(),
            Err(_) => {
                warn!(
                    "Schedule loop did not answer within {:?}",
                    self.shared.config.query_timeout
                );
                T::default()
            }
        }
    }
}

impl Drop for Center {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
