//! Runner handle
//!
//! The public face of the runner. Every call is a message to one of the
//! runner's loops, so callers never block on device I/O.

use std::sync::Arc;
use thinghub_core::domain::job::Operation;
use thinghub_core::domain::task::{Task, TaskChangeMsg};
use thinghub_core::domain::TaskId;
use thinghub_store::JobRepository;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::context::JobContexts;
use crate::error::RunnerError;
use crate::scheduler::DispatchCmd;
use crate::scheduler::dispatch::Dispatcher;
use crate::scheduler::outcome::OutcomeLoop;
use crate::service::Collaborators;

type Inboxes = (
    mpsc::UnboundedReceiver<DispatchCmd>,
    mpsc::UnboundedReceiver<TaskChangeMsg>,
);

pub struct Runner {
    config: RunnerConfig,
    repo: Arc<dyn JobRepository>,
    collaborators: Collaborators,
    dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
    outcome_tx: mpsc::UnboundedSender<TaskChangeMsg>,
    inboxes: Mutex<Option<Inboxes>>,
}

impl Runner {
    /// Creates a stopped runner
    ///
    /// Messages sent before [`Runner::start`] are buffered.
    pub fn new(
        config: RunnerConfig,
        repo: Arc<dyn JobRepository>,
        collaborators: Collaborators,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            config,
            repo,
            collaborators,
            dispatch_tx,
            outcome_tx,
            inboxes: Mutex::new(Some((dispatch_rx, outcome_rx))),
        }
    }

    /// Launches the dispatch and outcome loops
    ///
    /// Returns the outcome stream consumed by the center. Both loops end when
    /// `shutdown` is cancelled.
    pub async fn start(
        &self,
        contexts: JobContexts,
        shutdown: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<TaskChangeMsg>, RunnerError> {
        let (dispatch_rx, outcome_rx) = self
            .inboxes
            .lock()
            .await
            .take()
            .ok_or(RunnerError::AlreadyStarted)?;
        let (center_tx, center_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            self.config.clone(),
            self.repo.clone(),
            contexts.clone(),
            self.collaborators.clone(),
            self.outcome_tx.clone(),
        );
        let outcomes = OutcomeLoop::new(
            self.config.clone(),
            self.repo.clone(),
            contexts,
            self.dispatch_tx.clone(),
            center_tx,
        );

        tokio::spawn(dispatcher.run(dispatch_rx, shutdown.clone()));
        tokio::spawn(outcomes.run(outcome_rx, shutdown));

        info!("Runner started");
        Ok(center_rx)
    }

    /// Hands rolled-out tasks to the dispatch loop
    pub fn put_tasks(&self, operation: &Operation, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        debug!(%operation, "Putting {} task(s)", tasks.len());
        self.send(DispatchCmd::Put(tasks));
    }

    pub fn cancel_tasks_of_job(&self, job_id: &str) {
        self.send(DispatchCmd::RemoveJob(job_id.to_string()));
    }

    pub fn delete_tasks_of_job(&self, job_id: &str) {
        self.send(DispatchCmd::RemoveJob(job_id.to_string()));
    }

    pub fn cancel_task(&self, task_id: TaskId) {
        self.send(DispatchCmd::Remove(vec![task_id]));
    }

    pub fn delete_task(&self, task_id: TaskId) {
        self.send(DispatchCmd::Remove(vec![task_id]));
    }

    /// Undispatched and deferred tasks of a system operation
    ///
    /// Empty when the dispatch loop does not answer within the query timeout.
    pub async fn pending_tasks_of_sys(&self, operation: &Operation) -> Vec<Task> {
        let operation = operation.clone();
        self.query(|reply| DispatchCmd::PendingSys { operation, reply })
            .await
    }

    /// Tasks of custom operations not yet reported terminal
    pub async fn pending_tasks_of_custom(&self) -> Vec<Task> {
        self.query(|reply| DispatchCmd::PendingCustom { reply }).await
    }

    /// Feeds an externally observed outcome into the outcome path
    ///
    /// Used by custom-operation transports and the center's timeout sweep.
    pub fn report(&self, msg: TaskChangeMsg) {
        if self.outcome_tx.send(msg).is_err() {
            warn!("Outcome loop stopped, dropping reported outcome");
        }
    }

    async fn query(&self, build: impl FnOnce(oneshot::Sender<Vec<Task>>) -> DispatchCmd) -> Vec<Task> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply));
        match tokio::time::timeout(self.config.query_timeout, rx).await {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                warn!("Dispatch loop did not answer within {:?}", self.config.query_timeout);
                Vec::new()
            }
        }
    }

    fn send(&self, cmd: DispatchCmd) {
        if self.dispatch_tx.send(cmd).is_err() {
            warn!("Dispatch loop stopped, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Mocks, ScriptedInvoker, context, job};
    use std::time::Duration;
    use thinghub_core::domain::job::JobStatus;
    use thinghub_core::domain::task::{NewTask, TaskStatus};
    use thinghub_store::{MemoryRepository, TaskUpdate};
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| "thinghub_runner=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            dispatch_interval: Duration::from_millis(10),
            query_timeout: Duration::from_millis(200),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
            ..RunnerConfig::default()
        }
    }

    struct Harness {
        runner: Runner,
        repo: Arc<MemoryRepository>,
        mocks: Mocks,
        contexts: JobContexts,
        outcomes: mpsc::UnboundedReceiver<TaskChangeMsg>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn start(config: RunnerConfig, invoker: ScriptedInvoker) -> Self {
            init_tracing();
            let repo = Arc::new(MemoryRepository::new());
            let mocks = Mocks::new(invoker);
            let contexts = JobContexts::new();
            let shutdown = CancellationToken::new();
            let runner = Runner::new(config, repo.clone(), mocks.collaborators());
            let outcomes = runner.start(contexts.clone(), shutdown.clone()).await.unwrap();
            Self {
                runner,
                repo,
                mocks,
                contexts,
                outcomes,
                shutdown,
            }
        }

        async fn add_job(&self, job_id: &str) {
            if self.repo.get_job(job_id).await.unwrap().is_none() {
                self.repo.create_job(&job(job_id)).await.unwrap();
            }
            self.contexts.set(context(job_id)).await;
        }

        async fn tasks(&self, job_id: &str, things: &[&str]) -> Vec<Task> {
            self.add_job(job_id).await;
            let new = things
                .iter()
                .map(|thing| NewTask {
                    job_id: job_id.to_string(),
                    thing_id: thing.to_string(),
                    operation: Operation::InvokeMethod,
                })
                .collect();
            self.repo.create_tasks(new).await.unwrap()
        }

        /// Next outcome whose status is terminal, skipping Sent and retries
        async fn next_terminal(&mut self) -> TaskChangeMsg {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(2), self.outcomes.recv())
                    .await
                    .expect("outcome in time")
                    .expect("open stream");
                if msg.status.is_terminal() {
                    return msg;
                }
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let err = h.runner.start(h.contexts.clone(), h.shutdown.clone()).await;
        assert!(matches!(err, Err(RunnerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_dispatch_emits_sent_then_outcome_and_persists() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new().with_code("d2", 500)).await;
        let tasks = h.tasks("j1", &["d1", "d2"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        let first = tokio::time::timeout(Duration::from_secs(2), h.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, TaskStatus::Sent);

        let mut statuses = vec![h.next_terminal().await, h.next_terminal().await];
        statuses.sort_by_key(|m| m.task.task_id);
        assert_eq!(statuses[0].status, TaskStatus::Succeeded);
        assert_eq!(statuses[1].status, TaskStatus::Failed);

        let stored = h.repo.get_task(statuses[1].task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.status_details["code"], 500);
    }

    #[tokio::test]
    async fn test_offline_thing_deferred_until_connected() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        h.mocks.connectivity.set_offline("d1");
        let tasks = h.tasks("j1", &["d1"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.mocks.invoker.calls().is_empty());
        let pending = h.runner.pending_tasks_of_sys(&Operation::InvokeMethod).await;
        assert_eq!(pending.len(), 1);

        h.mocks.connectivity.connect("d1");
        let msg = h.next_terminal().await;
        assert_eq!(msg.status, TaskStatus::Succeeded);
        assert_eq!(h.mocks.invoker.calls_for("d1"), 1);
        assert!(h.runner.pending_tasks_of_sys(&Operation::InvokeMethod).await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_ttl_fails_deferred_task() {
        let config = RunnerConfig {
            offline_task_ttl: Some(Duration::from_millis(50)),
            ..fast_config()
        };
        let mut h = Harness::start(config, ScriptedInvoker::new()).await;
        h.mocks.connectivity.set_offline("d1");
        let tasks = h.tasks("j1", &["d1"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        let msg = h.next_terminal().await;
        assert_eq!(msg.status, TaskStatus::Failed);
        assert_eq!(msg.status_details["code"], 504);
        assert!(h.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_of_ending_job_are_dropped() {
        let h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let tasks = h.tasks("j1", &["d1", "d2"]).await;
        h.contexts.update("j1", |c| c.status = JobStatus::Canceling).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.mocks.invoker.calls().is_empty());
        assert!(h.runner.pending_tasks_of_sys(&Operation::InvokeMethod).await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatched_task_of_canceling_job_still_runs() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let mut tasks = h.tasks("j1", &["d1", "d2"]).await;
        tasks[0] = h
            .repo
            .transition_task(tasks[0].task_id, TaskUpdate::status(TaskStatus::Sent))
            .await
            .unwrap();
        h.contexts.update("j1", |c| c.status = JobStatus::Canceling).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        let msg = h.next_terminal().await;
        assert_eq!(msg.task.thing_id, "d1");
        assert_eq!(msg.status, TaskStatus::Succeeded);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.mocks.invoker.calls_for("d1"), 1);
        assert_eq!(h.mocks.invoker.calls_for("d2"), 0);
    }

    #[tokio::test]
    async fn test_task_of_finished_job_is_dropped_quietly() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let tasks = h.tasks("j1", &["d1"]).await;
        h.repo.cancel_tasks("j1", true).await.unwrap();
        h.contexts.remove("j1").await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.outcomes.try_recv().is_err());
        assert!(h.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_open_task_without_context_fails() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let tasks = h.tasks("j1", &["d1"]).await;
        h.contexts.remove("j1").await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        let msg = h.next_terminal().await;
        assert_eq!(msg.status, TaskStatus::Failed);
        assert_eq!(msg.status_details["code"], 500);
        assert!(h.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lagged_presence_stream_rechecks_offline_things() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        h.mocks.connectivity.set_offline("d1");
        let tasks = h.tasks("j1", &["d1"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.mocks.invoker.calls().is_empty());

        // No await until the stream overflowed, so the dispatcher cannot keep up
        h.mocks.connectivity.restore("d1");
        for i in 0..100 {
            h.mocks.connectivity.set_offline(&format!("x{i}"));
        }

        let msg = h.next_terminal().await;
        assert_eq!(msg.status, TaskStatus::Succeeded);
        assert_eq!(h.mocks.invoker.calls_for("d1"), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_requeues_instead_of_dropping() {
        let config = RunnerConfig {
            pool_size: 1,
            ..fast_config()
        };
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_millis(50));
        let mut h = Harness::start(config, invoker).await;
        let tasks = h.tasks("j1", &["d1", "d2", "d3"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        for _ in 0..3 {
            assert_eq!(h.next_terminal().await.status, TaskStatus::Succeeded);
        }
        assert_eq!(h.mocks.invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_job_removes_queued_tasks() {
        let h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        h.mocks.connectivity.set_offline("d1");
        h.mocks.connectivity.set_offline("d2");
        let tasks = h.tasks("j1", &["d1", "d2"]).await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.runner.cancel_tasks_of_job("j1");
        assert!(h.runner.pending_tasks_of_sys(&Operation::InvokeMethod).await.is_empty());
    }

    #[tokio::test]
    async fn test_late_outcome_does_not_overwrite_cancel() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        let task = h.tasks("j1", &["d1"]).await.remove(0);
        h.repo.cancel_tasks("j1", true).await.unwrap();

        h.runner.report(TaskChangeMsg::new(task.clone(), TaskStatus::Succeeded));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.outcomes.try_recv().is_err());
        let stored = h.repo.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_per_policy() {
        use thinghub_core::domain::config::{FailureType, RetryConfig, RetryCriteria};

        let invoker = ScriptedInvoker::new().with_sequence("d1", vec![500, 200]);
        let mut h = Harness::start(fast_config(), invoker).await;
        let tasks = h.tasks("j1", &["d1"]).await;
        h.contexts
            .update("j1", |c| {
                c.retry_config = Some(RetryConfig {
                    criteria_list: vec![RetryCriteria {
                        failure_type: FailureType::Failed,
                        number_of_retries: 1,
                    }],
                })
            })
            .await;
        h.runner.put_tasks(&Operation::InvokeMethod, tasks);

        let msg = h.next_terminal().await;
        assert_eq!(msg.status, TaskStatus::Succeeded);
        assert_eq!(h.mocks.invoker.calls_for("d1"), 2);
        let stored = h.repo.get_task(msg.task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_attempt, 1);
        assert_eq!(stored.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_custom_tasks_held_until_reported() {
        let mut h = Harness::start(fast_config(), ScriptedInvoker::new()).await;
        h.add_job("j1").await;
        let op = Operation::Custom("firmware".to_string());
        let task = h
            .repo
            .create_tasks(vec![NewTask {
                job_id: "j1".to_string(),
                thing_id: "d1".to_string(),
                operation: op.clone(),
            }])
            .await
            .unwrap()
            .remove(0);
        h.runner.put_tasks(&op, vec![task.clone()]);

        assert_eq!(h.runner.pending_tasks_of_custom().await.len(), 1);
        assert!(h.runner.pending_tasks_of_sys(&Operation::InvokeMethod).await.is_empty());

        h.runner.report(TaskChangeMsg::new(task, TaskStatus::Succeeded));
        assert_eq!(h.next_terminal().await.status, TaskStatus::Succeeded);
        assert!(h.runner.pending_tasks_of_custom().await.is_empty());
        assert!(h.mocks.invoker.calls().is_empty());
    }
}
