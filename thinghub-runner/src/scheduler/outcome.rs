//! Outcome loop
//!
//! Persists every task outcome with a guarded write, schedules retries and
//! forwards outcomes to the center.

use std::sync::Arc;
use thinghub_core::domain::task::{TaskChangeMsg, TaskStatus};
use thinghub_store::{JobRepository, StoreError, TaskUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::DispatchCmd;
use crate::config::RunnerConfig;
use crate::context::JobContexts;

pub(crate) struct OutcomeLoop {
    config: RunnerConfig,
    repo: Arc<dyn JobRepository>,
    contexts: JobContexts,
    dispatch: mpsc::UnboundedSender<DispatchCmd>,
    center: mpsc::UnboundedSender<TaskChangeMsg>,
}

impl OutcomeLoop {
    pub(crate) fn new(
        config: RunnerConfig,
        repo: Arc<dyn JobRepository>,
        contexts: JobContexts,
        dispatch: mpsc::UnboundedSender<DispatchCmd>,
        center: mpsc::UnboundedSender<TaskChangeMsg>,
    ) -> Self {
        Self {
            config,
            repo,
            contexts,
            dispatch,
            center,
        }
    }

    pub(crate) async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<TaskChangeMsg>,
        shutdown: CancellationToken,
    ) {
        info!("Starting outcome loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg, &shutdown).await,
                    None => break,
                },
            }
        }

        info!("Outcome loop stopped");
    }

    async fn handle(&self, msg: TaskChangeMsg, shutdown: &CancellationToken) {
        if matches!(msg.status, TaskStatus::Failed | TaskStatus::TimedOut)
            && self.retry(&msg, shutdown).await
        {
            return;
        }

        let task_id = msg.task.task_id;
        match self.repo.transition_task(task_id, TaskUpdate::from_change(&msg)).await {
            Ok(task) => {
                debug!(job_id = %task.job_id, task_id, status = %task.status, "Persisted task outcome");
            }
            Err(e) if e.is_stale_write() || matches!(e, StoreError::TaskNotFound(_)) => {
                debug!(task_id, status = %msg.status, "Ignoring outcome for settled task: {}", e);
                return;
            }
            Err(e) => {
                error!(task_id, status = %msg.status, "Failed to persist task outcome: {:#}", e);
            }
        }

        if msg.status.is_terminal() && !msg.task.operation.is_system() {
            let _ = self.dispatch.send(DispatchCmd::Remove(vec![task_id]));
        }
        self.forward(msg);
    }

    /// Requeues a failed task when its job's retry policy allows another attempt
    ///
    /// Returns true when the outcome was consumed by a retry.
    async fn retry(&self, msg: &TaskChangeMsg, shutdown: &CancellationToken) -> bool {
        let Some(ctx) = self.contexts.get(&msg.task.job_id).await else {
            return false;
        };
        if ctx.status.is_going_to_terminal() {
            return false;
        }
        let attempt = msg.task.retry_attempt;
        let allowed = ctx
            .retry_config
            .as_ref()
            .is_some_and(|retry| retry.should_retry(msg.status, attempt));
        if !allowed {
            return false;
        }

        let update = TaskUpdate {
            status: Some(TaskStatus::Queued),
            progress: Some(0),
            status_details: Some(msg.status_details.clone()),
            retry_attempt: Some(attempt.saturating_add(1)),
            ..Default::default()
        };
        let task = match self.repo.transition_task(msg.task.task_id, update).await {
            Ok(task) => task,
            Err(e) if e.is_stale_write() => {
                debug!(task_id = msg.task.task_id, "Task settled before retry: {}", e);
                return true;
            }
            Err(e) => {
                error!(task_id = msg.task.task_id, "Failed to requeue task for retry: {:#}", e);
                return false;
            }
        };

        let delay = self.config.retry_delay(attempt);
        info!(job_id = %task.job_id, task_id = task.task_id, attempt = task.retry_attempt,
            "Retrying {} task in {:?}", msg.status, delay);

        self.forward(
            TaskChangeMsg::new(task.clone(), TaskStatus::Queued)
                .with_details(task.status_details.clone()),
        );

        let dispatch = self.dispatch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = dispatch.send(DispatchCmd::Put(vec![task]));
                }
            }
        });
        true
    }

    fn forward(&self, msg: TaskChangeMsg) {
        if self.center.send(msg).is_err() {
            debug!("Center outcome stream closed");
        }
    }
}
