//! Job Service
//!
//! Validates management requests, writes their durable part and posts the
//! matching management message to the center.

use chrono::Utc;
use std::sync::Arc;
use thinghub_core::ValidationError;
use thinghub_core::domain::TaskId;
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::job::{Job, JobDetail, JobStatus, ProcessDetails};
use thinghub_core::domain::task::{NewTask, Task, TaskStatus};
use thinghub_core::dto::job::{CancelJobRequest, CreateJobRequest, JobQuery, UpdateJobRequest};
use thinghub_core::dto::page::{Page, PageRequest};
use thinghub_core::dto::task::{CancelTaskRequest, TaskQuery};
use thinghub_store::{JobRepository, JobUpdate, TaskUpdate};
use tracing::info;
use uuid::Uuid;

use crate::center::Center;
use crate::error::ServiceError;
use crate::message::MgrMsg;

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Clone)]
pub struct JobService {
    repo: Arc<dyn JobRepository>,
    center: Arc<Center>,
}

impl JobService {
    pub fn new(repo: Arc<dyn JobRepository>, center: Arc<Center>) -> Self {
        Self { repo, center }
    }

    /// Creates a job in `Waiting` and hands it to the center for scheduling
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let operation = req.validate()?;
        let now = Utc::now();

        let job = Job {
            job_id: req.job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            operation,
            target_config: req.target_config,
            job_doc: req.job_doc,
            description: req.description,
            scheduling_config: req.scheduling_config,
            rollout_config: req.rollout_config,
            retry_config: req.retry_config,
            timeout_config: req.timeout_config,
            status: JobStatus::Waiting,
            force_canceled: false,
            comment: String::new(),
            reason_code: String::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let context = JobContext::from_job(&job)
            .map_err(|e| ValidationError::invalid("jobDoc", e.to_string()))?;

        self.repo.create_job(&job).await?;

        let tasks = job
            .target_config
            .things
            .iter()
            .map(|thing_id| NewTask {
                job_id: job.job_id.clone(),
                thing_id: thing_id.clone(),
                operation: job.operation.clone(),
            })
            .collect();
        self.center.receive_mgr_msg(MgrMsg::CreateJob { context, tasks });

        info!(job_id = %job.job_id, operation = %job.operation,
            "Job created for {} thing(s)", job.target_config.things.len());
        Ok(job)
    }

    /// Updates the description, retry and timeout settings of a live job
    pub async fn update_job(&self, job_id: &str, req: UpdateJobRequest) -> Result<Job> {
        req.validate()?;
        let job = self.find_job(job_id).await?;
        if job.status.is_terminal() || job.status == JobStatus::Removing {
            return Err(ServiceError::InvalidState(format!(
                "job {job_id} is {} and can no longer be updated",
                job.status
            )));
        }

        let update = JobUpdate {
            description: req.description,
            retry_config: req.retry_config.clone(),
            timeout_config: req.timeout_config,
            ..Default::default()
        };
        let job = self.repo.update_job(job_id, update).await?;

        self.center.receive_mgr_msg(MgrMsg::UpdateJob {
            job_id: job_id.to_string(),
            retry_config: req.retry_config,
            timeout_config: req.timeout_config,
        });
        Ok(job)
    }

    /// Cancels a job
    ///
    /// Without `force` dispatched tasks finish and the job ends `Canceled`
    /// once they have; with it every unfinished task is canceled at once.
    pub async fn cancel_job(&self, job_id: &str, req: CancelJobRequest, force: bool) -> Result<Job> {
        req.validate()?;
        let job = self.find_job(job_id).await?;
        match job.status {
            JobStatus::Canceled | JobStatus::Completed | JobStatus::Removing => {
                return Err(ServiceError::InvalidState(format!(
                    "job {job_id} is {} and cannot be canceled",
                    job.status
                )));
            }
            JobStatus::Canceling if !force => {
                return Err(ServiceError::InvalidState(format!(
                    "job {job_id} is already canceling"
                )));
            }
            _ => {}
        }

        let update = JobUpdate {
            status: Some(JobStatus::Canceling),
            force_canceled: Some(force),
            comment: Some(req.comment),
            reason_code: Some(req.reason_code),
            expected_status: Some(job.status),
            ..Default::default()
        };
        let job = self.repo.update_job(job_id, update).await?;

        self.center.receive_mgr_msg(MgrMsg::CancelJob {
            job_id: job_id.to_string(),
            force,
        });
        info!(job_id, force, "Job cancel requested");
        Ok(job)
    }

    /// Marks a job `Removing`, the row goes once all its tasks are terminal
    pub async fn delete_job(&self, job_id: &str, force: bool) -> Result<Job> {
        let job = self.find_job(job_id).await?;
        if !force && job.status == JobStatus::InProgress {
            return Err(ServiceError::InvalidState(format!(
                "job {job_id} is in progress, cancel it first or delete with force"
            )));
        }

        let update = JobUpdate {
            expected_status: Some(job.status),
            ..JobUpdate::status(JobStatus::Removing)
        };
        let job = self.repo.update_job(job_id, update).await?;

        self.center.receive_mgr_msg(MgrMsg::DeleteJob {
            job_id: job_id.to_string(),
            force,
        });
        info!(job_id, force, "Job delete requested");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobDetail> {
        let job = self.find_job(job_id).await?;
        let counts = self.repo.count_task_status(job_id).await?;
        Ok(JobDetail {
            job,
            process_details: ProcessDetails::from_counts(&counts),
        })
    }

    pub async fn query_jobs(&self, query: &JobQuery) -> Result<Page<Job>> {
        Ok(self.repo.query_jobs(query).await?)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("task {task_id}")))
    }

    pub async fn query_tasks(&self, query: &TaskQuery) -> Result<Page<Task>> {
        Ok(self.repo.query_tasks(query).await?)
    }

    pub async fn query_tasks_for_job(&self, job_id: &str, page: PageRequest) -> Result<Page<Task>> {
        self.query_tasks(&TaskQuery::for_job(job_id, page)).await
    }

    pub async fn query_tasks_for_thing(&self, thing_id: &str, page: PageRequest) -> Result<Page<Task>> {
        self.query_tasks(&TaskQuery::for_thing(thing_id, page)).await
    }

    /// Cancels one task
    ///
    /// An in-progress task needs `force`. A set `expected_version` must match
    /// the stored version.
    pub async fn cancel_task(&self, task_id: TaskId, req: CancelTaskRequest, force: bool) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        if !force && task.status == TaskStatus::InProgress {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is in progress, cancel with force"
            )));
        }

        let update = TaskUpdate {
            status: Some(TaskStatus::Canceled),
            force_canceled: Some(force),
            status_details: req.status_details,
            expected_version: req.expected_version,
            ..Default::default()
        };
        let task = self.repo.transition_task(task_id, update).await?;

        self.center.receive_mgr_msg(MgrMsg::CancelTask {
            job_id: task.job_id.clone(),
            task_id,
        });
        info!(job_id = %task.job_id, task_id, force, "Task canceled");
        Ok(task)
    }

    pub async fn delete_task(&self, task_id: TaskId, force: bool) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if !force && task.status == TaskStatus::InProgress {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is in progress, delete with force"
            )));
        }

        let task = self.repo.delete_task(task_id).await?;
        self.center.receive_mgr_msg(MgrMsg::DeleteTask {
            job_id: task.job_id.clone(),
            task_id,
        });
        info!(job_id = %task.job_id, task_id, "Task deleted");
        Ok(task)
    }

    async fn find_job(&self, job_id: &str) -> Result<Job> {
        self.repo
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("job {job_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CenterConfig;
    use crate::error::CenterError;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;
    use thinghub_core::domain::config::{
        EndBehavior, FailureType, RetryConfig, RetryCriteria, RolloutConfig, SchedulingConfig,
        TimeoutConfig,
    };
    use thinghub_core::domain::job::{OP_INVOKE_METHOD, OP_UPDATE_DESIRED};
    use thinghub_runner::RunnerConfig;
    use thinghub_runner::testing::{self, Mocks, RecordingDesiredSetter, ScriptedInvoker};
    use thinghub_store::MemoryRepository;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "thinghub_center=debug,thinghub_runner=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn fast_config() -> CenterConfig {
        CenterConfig {
            schedule_interval: Duration::from_millis(10),
            check_job_interval: Duration::from_millis(20),
            pool_size: 8,
            query_timeout: Duration::from_millis(500),
            runner: RunnerConfig {
                dispatch_interval: Duration::from_millis(5),
                query_timeout: Duration::from_millis(500),
                retry_base_delay: Duration::from_millis(10),
                retry_max_delay: Duration::from_millis(50),
                ..RunnerConfig::default()
            },
        }
    }

    struct Fixture {
        service: JobService,
        center: Arc<Center>,
        repo: Arc<MemoryRepository>,
        mocks: Mocks,
    }

    impl Fixture {
        async fn start(invoker: ScriptedInvoker) -> Self {
            Self::start_with(Arc::new(MemoryRepository::new()), Mocks::new(invoker)).await
        }

        async fn start_with(repo: Arc<MemoryRepository>, mocks: Mocks) -> Self {
            init_tracing();
            let center = Arc::new(Center::new(fast_config(), repo.clone(), mocks.collaborators()));
            center.start().await.unwrap();
            Self {
                service: JobService::new(repo.clone(), center.clone()),
                center,
                repo,
                mocks,
            }
        }

        async fn status(&self, job_id: &str) -> Option<JobStatus> {
            self.service.get_job(job_id).await.ok().map(|d| d.job.status)
        }

        async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> JobDetail {
            let reached =
                wait_until(|| async move { self.status(job_id).await == Some(status) }).await;
            let detail = self.service.get_job(job_id).await.unwrap();
            assert!(reached, "job {job_id} stuck at {}", detail.job.status);
            detail
        }
    }

    async fn wait_until<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn reboot_job(job_id: &str, things: &[&str]) -> CreateJobRequest {
        let mut req = CreateJobRequest::new(OP_INVOKE_METHOD, things.iter().copied());
        req.job_id = Some(job_id.to_string());
        req.job_doc = Some(json!({"method": "reboot", "responseTimeout": 5}));
        req
    }

    fn throttled(mut req: CreateJobRequest, max_per_minute: u32) -> CreateJobRequest {
        req.rollout_config = Some(RolloutConfig { max_per_minute });
        req
    }

    /// One task per minute inside a window that closes shortly
    fn closing_window(req: CreateJobRequest, end_behavior: EndBehavior) -> CreateJobRequest {
        let mut req = throttled(req, 1);
        req.scheduling_config = Some(SchedulingConfig {
            start_time: Utc::now() - ChronoDuration::hours(1),
            end_time: Some(Utc::now() + ChronoDuration::milliseconds(300)),
            end_behavior,
        });
        req
    }

    /// Stores a job as a crashed center left it, one task per `(thing, status)`
    async fn seed_job(repo: &MemoryRepository, job: Job, tasks: &[(&str, TaskStatus)]) {
        repo.create_job(&job).await.unwrap();
        let new = tasks
            .iter()
            .map(|(thing, _)| NewTask {
                job_id: job.job_id.clone(),
                thing_id: thing.to_string(),
                operation: job.operation.clone(),
            })
            .collect();
        let created = repo.create_tasks(new).await.unwrap();
        for (task, (_, status)) in created.iter().zip(tasks) {
            if *status != TaskStatus::Queued {
                repo.transition_task(task.task_id, TaskUpdate::status(*status))
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_mixed_outcomes_complete_the_job() {
        let f = Fixture::start(ScriptedInvoker::new().with_code("d2", 500)).await;
        f.service
            .create_job(reboot_job("J1", &["d1", "d2", "d3", "d4"]))
            .await
            .unwrap();

        let detail = f.wait_for_status("J1", JobStatus::Completed).await;
        assert_eq!(detail.process_details.succeeded, 3);
        assert_eq!(detail.process_details.failed, 1);
        assert_eq!(detail.process_details.total(), 4);
        assert!(detail.job.started_at.is_some());
        assert!(detail.job.completed_at.is_some());
        assert_eq!(f.mocks.invoker.calls().len(), 4);
        assert!(f.center.get_pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_cancel_throttled_job() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.service
            .create_job(throttled(reboot_job("J2", &["d1", "d2", "d3", "d4"]), 1))
            .await
            .unwrap();
        f.service
            .cancel_job("J2", CancelJobRequest::default(), true)
            .await
            .unwrap();

        let detail = f.wait_for_status("J2", JobStatus::Canceled).await;
        assert!(detail.job.force_canceled);
        assert!(
            wait_until(|| async { f.center.get_pending_tasks("J2").await.is_empty() }).await
        );
        assert!(f.mocks.invoker.calls().len() <= 1);
        assert!(detail.process_details.canceled >= 3);
    }

    #[tokio::test]
    async fn test_graceful_cancel_lets_dispatched_task_finish() {
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_millis(200));
        let f = Fixture::start(invoker).await;
        f.service
            .create_job(throttled(reboot_job("J3", &["d1", "d2", "d3"]), 1))
            .await
            .unwrap();
        assert!(wait_until(|| async { f.mocks.invoker.calls().len() == 1 }).await);

        let req = CancelJobRequest {
            comment: "maintenance window moved".to_string(),
            reason_code: "RESCHEDULED".to_string(),
        };
        let job = f.service.cancel_job("J3", req, false).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceling);

        let detail = f.wait_for_status("J3", JobStatus::Canceled).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(detail.process_details.canceled, 2);
        assert_eq!(detail.job.reason_code, "RESCHEDULED");
        assert!(!detail.job.force_canceled);
        assert_eq!(f.mocks.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_thing_runs_after_connect() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.mocks.connectivity.set_offline("d1");
        f.service.create_job(reboot_job("J4", &["d1"])).await.unwrap();

        assert!(wait_until(|| async { f.status("J4").await == Some(JobStatus::InProgress) }).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.mocks.invoker.calls().is_empty());
        assert_eq!(f.status("J4").await, Some(JobStatus::InProgress));

        f.mocks.connectivity.connect("d1");
        let detail = f.wait_for_status("J4", JobStatus::Completed).await;
        assert_eq!(detail.process_details.succeeded, 1);
    }

    #[tokio::test]
    async fn test_rollout_is_throttled_per_minute() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.service
            .create_job(throttled(reboot_job("J5", &["d1", "d2", "d3", "d4", "d5"]), 2))
            .await
            .unwrap();

        assert!(wait_until(|| async { f.mocks.invoker.calls().len() == 2 }).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.mocks.invoker.calls().len(), 2);
        assert_eq!(f.center.get_pending_tasks("J5").await.len(), 3);

        let pending = f.center.get_pending_jobs().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].pending_tasks, 3);
        assert_eq!(pending[0].status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_reload_reproduces_pending_tasks() {
        let repo = Arc::new(MemoryRepository::new());
        let first = Fixture::start_with(repo.clone(), Mocks::new(ScriptedInvoker::new())).await;

        let mut req = reboot_job("J6", &["d1", "d2", "d3"]);
        req.scheduling_config = Some(SchedulingConfig {
            start_time: Utc::now() + ChronoDuration::hours(1),
            end_time: None,
            end_behavior: EndBehavior::StopRollout,
        });
        first.service.create_job(req).await.unwrap();
        assert!(
            wait_until(|| async { first.center.get_pending_tasks("J6").await.len() == 3 }).await
        );
        first.center.stop();
        drop(first);

        let second = Fixture::start_with(repo, Mocks::new(ScriptedInvoker::new())).await;
        assert_eq!(second.center.get_pending_tasks("J6").await.len(), 3);
        assert_eq!(second.status("J6").await, Some(JobStatus::Waiting));
        assert!(second.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_retried_then_succeeds() {
        let invoker = ScriptedInvoker::new().with_sequence("d1", vec![500, 200]);
        let f = Fixture::start(invoker).await;
        let mut req = reboot_job("J7", &["d1"]);
        req.retry_config = Some(RetryConfig {
            criteria_list: vec![RetryCriteria {
                failure_type: FailureType::Failed,
                number_of_retries: 2,
            }],
        });
        f.service.create_job(req).await.unwrap();

        let detail = f.wait_for_status("J7", JobStatus::Completed).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(f.mocks.invoker.calls_for("d1"), 2);

        let tasks = f.service.query_tasks_for_job("J7", PageRequest::default()).await.unwrap();
        assert_eq!(tasks.items[0].retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_window_closed_before_start_cancels_job() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        let mut req = reboot_job("J8", &["d1", "d2"]);
        req.scheduling_config = Some(SchedulingConfig {
            start_time: Utc::now() - ChronoDuration::hours(2),
            end_time: Some(Utc::now() - ChronoDuration::hours(1)),
            end_behavior: EndBehavior::StopRollout,
        });
        f.service.create_job(req).await.unwrap();

        let detail = f.wait_for_status("J8", JobStatus::Canceled).await;
        assert_eq!(detail.process_details.canceled, 2);
        assert!(f.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_completed_job_removes_rows() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.service.create_job(reboot_job("J9", &["d1", "d2"])).await.unwrap();
        f.wait_for_status("J9", JobStatus::Completed).await;

        let job = f.service.delete_job("J9", false).await.unwrap();
        assert_eq!(job.status, JobStatus::Removing);
        assert!(wait_until(|| async { f.status("J9").await.is_none() }).await);
        assert!(f.repo.tasks_of_job("J9", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_in_progress_job_requires_force() {
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_secs(5));
        let f = Fixture::start(invoker).await;
        f.service.create_job(reboot_job("J10", &["d1"])).await.unwrap();
        assert!(wait_until(|| async { f.status("J10").await == Some(JobStatus::InProgress) }).await);

        let err = f.service.delete_job("J10", false).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        f.service.delete_job("J10", true).await.unwrap();
        assert!(wait_until(|| async { f.status("J10").await.is_none() }).await);
    }

    #[tokio::test]
    async fn test_cancel_task_checks_state_and_version() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.mocks.connectivity.set_offline("d1");
        f.mocks.connectivity.set_offline("d2");
        f.service.create_job(reboot_job("J11", &["d1", "d2"])).await.unwrap();
        assert!(
            wait_until(|| async {
                f.service
                    .query_tasks_for_job("J11", PageRequest::default())
                    .await
                    .is_ok_and(|p| p.total == 2)
            })
            .await
        );
        let tasks = f.service.query_tasks_for_job("J11", PageRequest::default()).await.unwrap();
        let (first, second) = (&tasks.items[0], &tasks.items[1]);

        let stale = CancelTaskRequest {
            expected_version: Some(first.version + 7),
            status_details: None,
        };
        let err = f.service.cancel_task(first.task_id, stale, false).await.unwrap_err();
        assert!(matches!(err, ServiceError::VersionConflict { .. }));

        let current = f.service.get_task(first.task_id).await.unwrap();
        let req = CancelTaskRequest {
            expected_version: Some(current.version),
            status_details: None,
        };
        let canceled = f.service.cancel_task(first.task_id, req, false).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);

        let err = f
            .service
            .cancel_task(first.task_id, CancelTaskRequest::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        f.service.delete_task(second.task_id, false).await.unwrap();
        let detail = f.wait_for_status("J11", JobStatus::Completed).await;
        assert_eq!(detail.process_details.canceled, 1);
        assert_eq!(detail.process_details.total(), 1);
        assert!(f.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let f = Fixture::start(ScriptedInvoker::new()).await;

        let mut req = reboot_job("bad id!", &["d1"]);
        assert!(matches!(
            f.service.create_job(req.clone()).await,
            Err(ServiceError::Validation(_))
        ));

        req.job_id = None;
        req.job_doc = None;
        assert!(matches!(f.service.create_job(req).await, Err(ServiceError::Validation(_))));

        assert!(matches!(
            f.service.get_job("missing").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            f.service.cancel_job("missing", CancelJobRequest::default(), false).await,
            Err(ServiceError::NotFound(_))
        ));

        f.service.create_job(reboot_job("J12", &["d1"])).await.unwrap();
        assert!(matches!(
            f.service.create_job(reboot_job("J12", &["d1"])).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_generated_job_id_and_late_update_rejected() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        let mut req = reboot_job("unused", &["d1"]);
        req.job_id = None;
        let job = f.service.create_job(req).await.unwrap();
        assert!(Uuid::parse_str(&job.job_id).is_ok());

        f.wait_for_status(&job.job_id, JobStatus::Completed).await;
        let update = UpdateJobRequest {
            description: Some("late".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            f.service.update_job(&job.job_id, update).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_into_live_context() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        f.mocks.connectivity.set_offline("d1");
        f.service.create_job(reboot_job("J13", &["d1"])).await.unwrap();
        assert!(wait_until(|| async { f.status("J13").await == Some(JobStatus::InProgress) }).await);

        let retry = RetryConfig {
            criteria_list: vec![RetryCriteria {
                failure_type: FailureType::Failed,
                number_of_retries: 3,
            }],
        };
        let timeout = TimeoutConfig {
            in_progress_minutes: 30,
        };
        let update = UpdateJobRequest {
            description: Some("staged".to_string()),
            retry_config: Some(retry.clone()),
            timeout_config: Some(timeout),
        };
        let job = f.service.update_job("J13", update).await.unwrap();
        assert_eq!(job.retry_config.as_ref(), Some(&retry));
        assert_eq!(job.description, "staged");

        let merged = wait_until(|| async {
            f.center.contexts().get("J13").await.is_some_and(|ctx| {
                ctx.retry_config.as_ref() == Some(&retry) && ctx.timeout_config == Some(timeout)
            })
        })
        .await;
        assert!(merged);
        assert_eq!(f.status("J13").await, Some(JobStatus::InProgress));
    }

    #[tokio::test]
    async fn test_update_desired_job_end_to_end() {
        let mocks = Mocks {
            desired: Arc::new(RecordingDesiredSetter::new().failing_for("d2")),
            ..Mocks::new(ScriptedInvoker::new())
        };
        let f = Fixture::start_with(Arc::new(MemoryRepository::new()), mocks).await;
        let mut req = CreateJobRequest::new(OP_UPDATE_DESIRED, ["d1", "d2"]);
        req.job_id = Some("J14".to_string());
        req.job_doc = Some(json!({"state": {"desired": {"led": "on"}}}));
        f.service.create_job(req).await.unwrap();

        let detail = f.wait_for_status("J14", JobStatus::Completed).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(detail.process_details.failed, 1);
        assert!(f.mocks.invoker.calls().is_empty());

        let mut calls = f.mocks.desired.calls();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "d1");
        assert_eq!(calls[0].1, json!({"led": "on"}));
    }

    #[tokio::test]
    async fn test_window_end_stops_rollout_of_started_job() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        let req = closing_window(reboot_job("J15", &["d1", "d2", "d3"]), EndBehavior::StopRollout);
        f.service.create_job(req).await.unwrap();

        let detail = f.wait_for_status("J15", JobStatus::Completed).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(detail.process_details.canceled, 2);
        assert!(!detail.job.force_canceled);
        assert_eq!(f.mocks.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_window_end_cancels_started_job() {
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_millis(600));
        let f = Fixture::start(invoker).await;
        let req = closing_window(reboot_job("J16", &["d1", "d2", "d3"]), EndBehavior::Cancel);
        f.service.create_job(req).await.unwrap();

        assert!(wait_until(|| async { f.status("J16").await == Some(JobStatus::Canceling) }).await);
        let detail = f.wait_for_status("J16", JobStatus::Canceled).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(detail.process_details.canceled, 2);
        assert!(!detail.job.force_canceled);
        assert_eq!(f.mocks.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_window_end_force_cancels_started_job() {
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_secs(5));
        let f = Fixture::start(invoker).await;
        let req = closing_window(reboot_job("J17", &["d1", "d2", "d3"]), EndBehavior::ForceCancel);
        f.service.create_job(req).await.unwrap();

        let settled = wait_until(|| async {
            f.service.get_job("J17").await.is_ok_and(|d| {
                d.job.status == JobStatus::Canceled && d.process_details.canceled == 3
            })
        })
        .await;
        assert!(settled);
        let detail = f.service.get_job("J17").await.unwrap();
        assert!(detail.job.force_canceled);
        assert_eq!(f.mocks.invoker.calls().len(), 1);
        assert!(f.center.get_pending_tasks("J17").await.is_empty());
    }

    #[tokio::test]
    async fn test_task_past_in_progress_limit_times_out() {
        let repo = Arc::new(MemoryRepository::new());
        let job = Job {
            timeout_config: Some(TimeoutConfig {
                in_progress_minutes: 0,
            }),
            ..testing::job("J18")
        };
        seed_job(&repo, job, &[("d1", TaskStatus::InProgress)]).await;
        let mocks = Mocks::new(ScriptedInvoker::new());
        mocks.connectivity.set_offline("d1");
        let f = Fixture::start_with(repo, mocks).await;

        let detail = f.wait_for_status("J18", JobStatus::Completed).await;
        assert_eq!(detail.process_details.timed_out, 1);
        let tasks = f.service.query_tasks_for_job("J18", PageRequest::default()).await.unwrap();
        assert_eq!(tasks.items[0].status, TaskStatus::TimedOut);
        assert_eq!(tasks.items[0].status_details["code"], 408);
        assert!(f.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reload_finishes_graceful_cancel_with_dispatched_task() {
        let repo = Arc::new(MemoryRepository::new());
        let job = Job {
            status: JobStatus::Canceling,
            ..testing::job("J19")
        };
        seed_job(&repo, job, &[("d1", TaskStatus::Sent), ("d2", TaskStatus::Canceled)]).await;
        let f = Fixture::start_with(repo, Mocks::new(ScriptedInvoker::new())).await;

        let detail = f.wait_for_status("J19", JobStatus::Canceled).await;
        assert_eq!(detail.process_details.succeeded, 1);
        assert_eq!(detail.process_details.canceled, 1);
        assert!(!detail.job.force_canceled);
        assert_eq!(f.mocks.invoker.calls_for("d1"), 1);
    }

    #[tokio::test]
    async fn test_reload_cancels_queued_tasks_of_canceling_job() {
        let repo = Arc::new(MemoryRepository::new());
        let job = Job {
            status: JobStatus::Canceling,
            ..testing::job("J20")
        };
        seed_job(&repo, job, &[("d1", TaskStatus::Queued), ("d2", TaskStatus::Queued)]).await;
        let f = Fixture::start_with(repo, Mocks::new(ScriptedInvoker::new())).await;

        let detail = f.wait_for_status("J20", JobStatus::Canceled).await;
        assert_eq!(detail.process_details.canceled, 2);
        assert!(f.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reload_deletes_removing_job_without_running_it() {
        let repo = Arc::new(MemoryRepository::new());
        let job = Job {
            status: JobStatus::Removing,
            ..testing::job("J21")
        };
        seed_job(&repo, job, &[("d1", TaskStatus::Sent), ("d2", TaskStatus::Queued)]).await;
        let f = Fixture::start_with(repo, Mocks::new(ScriptedInvoker::new())).await;

        assert!(wait_until(|| async { f.status("J21").await.is_none() }).await);
        assert!(f.repo.tasks_of_job("J21", &[]).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.mocks.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_center_starts_once() {
        let f = Fixture::start(ScriptedInvoker::new()).await;
        assert!(matches!(f.center.start().await, Err(CenterError::AlreadyStarted)));
    }
}
