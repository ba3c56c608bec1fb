//! Dispatch loop
//!
//! Pops system-operation tasks on every tick and submits them to the worker
//! pool. Tasks for offline things wait in a per-thing map until the thing
//! connects. Custom-operation tasks are only held per thing for introspection
//! since an external transport drives them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::document::JobDocument;
use thinghub_core::domain::job::{JobStatus, Operation};
use thinghub_core::domain::task::{Task, TaskChangeMsg, TaskStatus};
use thinghub_core::domain::thing::{PresenceEvent, PresenceEventType};
use thinghub_core::domain::{TaskId, ThingId};
use thinghub_store::JobRepository;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchCmd;
use crate::action::{self, CODE_INTERNAL_ERROR};
use crate::config::RunnerConfig;
use crate::context::JobContexts;
use crate::queue::TaskQueue;
use crate::service::Collaborators;

/// Code of tasks failed after waiting too long for their thing
pub const CODE_THING_OFFLINE: i64 = 504;

struct Deferred {
    since: Instant,
    task: Task,
}

/// Whether a task of an ending job still runs
///
/// A gracefully canceling job lets dispatched tasks finish. After a restart
/// those come back through the queue as Sent or InProgress.
pub fn runs_while_ending(ctx: &JobContext, task: &Task) -> bool {
    ctx.status == JobStatus::Canceling && !ctx.force_canceled && task.status.is_ongoing()
}

pub(crate) struct Dispatcher {
    config: RunnerConfig,
    repo: Arc<dyn JobRepository>,
    contexts: JobContexts,
    collaborators: Collaborators,
    semaphore: Arc<Semaphore>,
    outcomes: mpsc::UnboundedSender<TaskChangeMsg>,
    queue: TaskQueue,
    offline: HashMap<ThingId, Vec<Deferred>>,
    custom: HashMap<ThingId, TaskQueue>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: RunnerConfig,
        repo: Arc<dyn JobRepository>,
        contexts: JobContexts,
        collaborators: Collaborators,
        outcomes: mpsc::UnboundedSender<TaskChangeMsg>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.pool_size));
        Self {
            config,
            repo,
            contexts,
            collaborators,
            semaphore,
            outcomes,
            queue: TaskQueue::new(),
            offline: HashMap::new(),
            custom: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DispatchCmd>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Starting dispatch loop (interval: {:?}, per tick: {}, pool: {})",
            self.config.dispatch_interval, self.config.dispatch_per_tick, self.config.pool_size
        );

        let mut presence = self.collaborators.connectivity.on_connect();
        let mut presence_open = true;
        let mut ticker = time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                event = presence.recv(), if presence_open => match event {
                    Ok(event) => self.on_presence(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Presence stream lagged by {} events, rechecking offline things", skipped);
                        self.recheck_offline().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Presence stream closed, offline tasks wait for rechecks only");
                        presence_open = false;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!(
            "Dispatch loop stopped with {} queued and {} deferred task(s)",
            self.queue.len(),
            self.deferred_count()
        );
    }

    fn handle(&mut self, cmd: DispatchCmd) {
        match cmd {
            DispatchCmd::Put(tasks) => {
                debug!("Received {} task(s)", tasks.len());
                for task in tasks {
                    if task.operation.is_system() {
                        self.queue.push(task);
                    } else {
                        self.custom.entry(task.thing_id.clone()).or_default().push(task);
                    }
                }
            }
            DispatchCmd::Remove(ids) => {
                let ids: HashSet<TaskId> = ids.into_iter().collect();
                let removed = self.remove_where(|t| ids.contains(&t.task_id));
                debug!("Removed {} task(s) by id", removed);
            }
            DispatchCmd::RemoveJob(job_id) => {
                let removed = self.remove_where(|t| t.job_id == job_id);
                debug!(job_id = %job_id, "Removed {} task(s) of job", removed);
            }
            DispatchCmd::PendingSys { operation, reply } => {
                let mut tasks: Vec<Task> = self
                    .queue
                    .tasks()
                    .into_iter()
                    .filter(|t| t.operation == operation)
                    .collect();
                tasks.extend(
                    self.offline
                        .values()
                        .flatten()
                        .filter(|d| d.task.operation == operation)
                        .map(|d| d.task.clone()),
                );
                let _ = reply.send(tasks);
            }
            DispatchCmd::PendingCustom { reply } => {
                let tasks = self.custom.values().flat_map(TaskQueue::tasks).collect();
                let _ = reply.send(tasks);
            }
        }
    }

    /// Removes matching tasks everywhere, returns how many were dropped
    fn remove_where(&mut self, pred: impl Fn(&Task) -> bool) -> usize {
        let mut removed = self.queue.remove_where(&pred).len();
        self.offline.retain(|_, deferred| {
            let before = deferred.len();
            deferred.retain(|d| !pred(&d.task));
            removed += before - deferred.len();
            !deferred.is_empty()
        });
        self.custom.retain(|_, queue| {
            removed += queue.remove_where(&pred).len();
            !queue.is_empty()
        });
        removed
    }

    fn on_presence(&mut self, event: PresenceEvent) {
        if event.event_type != PresenceEventType::Connected {
            return;
        }
        if let Some(deferred) = self.offline.remove(&event.thing_id) {
            info!(thing_id = %event.thing_id, "Thing connected, requeueing {} deferred task(s)", deferred.len());
            for d in deferred {
                self.queue.push(d.task);
            }
        }
    }

    /// Asks the checker directly for every thing with deferred tasks
    async fn recheck_offline(&mut self) {
        let things: Vec<ThingId> = self.offline.keys().cloned().collect();
        for thing_id in things {
            match self.collaborators.connectivity.is_connected(&thing_id).await {
                Ok(true) => self.on_presence(PresenceEvent::connected(thing_id)),
                Ok(false) => {}
                Err(e) => warn!(thing_id = %thing_id, "Connectivity check failed: {:#}", e),
            }
        }
    }

    async fn tick(&mut self) {
        if let Some(ttl) = self.config.offline_task_ttl {
            self.expire_offline(ttl);
        }

        for _ in 0..self.config.dispatch_per_tick {
            let Some(task) = self.queue.pop() else {
                break;
            };

            let Some(ctx) = self.contexts.get(&task.job_id).await else {
                self.drop_orphan(task).await;
                continue;
            };

            if ctx.status.is_going_to_terminal() && !runs_while_ending(&ctx, &task) {
                debug!(job_id = %task.job_id, task_id = task.task_id, status = %ctx.status,
                    "Dropping task of ending job");
                continue;
            }

            if task.operation == Operation::InvokeMethod {
                let online = match self.collaborators.connectivity.is_connected(&task.thing_id).await {
                    Ok(online) => online,
                    Err(e) => {
                        warn!(thing_id = %task.thing_id, "Connectivity check failed, deferring: {:#}", e);
                        false
                    }
                };
                if !online {
                    self.defer(task);
                    continue;
                }
            }

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Worker pool saturated, retrying next tick");
                    self.queue.push(task);
                    break;
                }
            };

            if task.status == TaskStatus::Queued {
                self.emit(TaskChangeMsg::new(task.clone(), TaskStatus::Sent));
            }
            self.spawn_action(task, ctx.job_doc, permit);
        }
    }

    /// Handles a task whose job context is gone
    ///
    /// Finished or force-canceled jobs leave late retries behind, those are
    /// dropped. A task still open in the repository is failed.
    async fn drop_orphan(&self, task: Task) {
        match self.repo.get_task(task.task_id).await {
            Ok(Some(stored)) if stored.status.is_terminal() => {
                debug!(job_id = %task.job_id, task_id = task.task_id, "Dropping task of finished job");
                return;
            }
            Ok(None) => {
                debug!(job_id = %task.job_id, task_id = task.task_id, "Dropping task of deleted job");
                return;
            }
            Ok(Some(_)) => {
                error!(job_id = %task.job_id, task_id = task.task_id, "No job context for open task");
            }
            Err(e) => {
                error!(job_id = %task.job_id, task_id = task.task_id,
                    "No job context and task lookup failed: {:#}", e);
            }
        }
        self.emit(
            TaskChangeMsg::new(task, TaskStatus::Failed)
                .with_code(CODE_INTERNAL_ERROR, "job context missing"),
        );
    }

    fn defer(&mut self, task: Task) {
        debug!(thing_id = %task.thing_id, task_id = task.task_id, "Thing offline, deferring task");
        self.offline
            .entry(task.thing_id.clone())
            .or_default()
            .push(Deferred {
                since: Instant::now(),
                task,
            });
    }

    fn expire_offline(&mut self, ttl: Duration) {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.offline.retain(|_, deferred| {
            deferred.retain(|d| {
                let keep = now.duration_since(d.since) < ttl;
                if !keep {
                    expired.push(d.task.clone());
                }
                keep
            });
            !deferred.is_empty()
        });

        for task in expired {
            warn!(thing_id = %task.thing_id, task_id = task.task_id, "Thing stayed offline, failing task");
            self.emit(
                TaskChangeMsg::new(task, TaskStatus::Failed)
                    .with_code(CODE_THING_OFFLINE, "thing offline"),
            );
        }
    }

    fn spawn_action(&self, task: Task, doc: JobDocument, permit: OwnedSemaphorePermit) {
        let collaborators = self.collaborators.clone();
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            let msg = action::execute(&collaborators, task, &doc).await;
            if outcomes.send(msg).is_err() {
                debug!("Outcome loop gone, dropping task outcome");
            }
            drop(permit);
        });
    }

    fn emit(&self, msg: TaskChangeMsg) {
        if self.outcomes.send(msg).is_err() {
            debug!("Outcome loop gone, dropping task outcome");
        }
    }

    fn deferred_count(&self) -> usize {
        self.offline.values().map(Vec::len).sum()
    }
}
