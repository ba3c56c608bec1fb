//! Repository layer
//!
//! Durable storage of jobs and tasks. The engine depends only on the
//! [`JobRepository`] trait; [`MemoryRepository`] backs tests and embedded
//! use, [`PgRepository`] backs production deployments.

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use thinghub_core::domain::TaskId;
use thinghub_core::domain::job::{Job, JobStatus};
use thinghub_core::domain::task::{NewTask, Task, TaskStatus, TaskStatusCount};
use thinghub_core::dto::job::JobQuery;
use thinghub_core::dto::page::Page;
use thinghub_core::dto::task::TaskQuery;

use crate::error::Result;
use crate::update::{JobUpdate, TaskUpdate};

/// Job statuses whose jobs are reloaded into the scheduler at startup
pub const PENDING_JOB_STATUSES: [JobStatus; 4] = [
    JobStatus::Waiting,
    JobStatus::InProgress,
    JobStatus::Canceling,
    JobStatus::Removing,
];

/// A non-terminal job with its unfinished tasks
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub job: Job,
    pub tasks: Vec<Task>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts a job, failing with `Duplicated` when the id is taken
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<Job>;

    /// Deletes a job and its tasks
    ///
    /// Without `force` a job still `InProgress` is rejected with `Conflict`.
    async fn delete_job(&self, job_id: &str, force: bool) -> Result<Job>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Jobs newest first
    async fn query_jobs(&self, query: &JobQuery) -> Result<Page<Job>>;

    /// Inserts all tasks in one transaction, returning them with their ids
    async fn create_tasks(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>>;

    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task>;

    /// Read-check-write of a task in one transaction
    ///
    /// Fails with `TaskTerminal` when the stored task already finished, so a
    /// late or duplicated outcome never overwrites a cancellation.
    async fn transition_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task>;

    async fn delete_task(&self, task_id: TaskId) -> Result<Task>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Tasks in id order
    async fn query_tasks(&self, query: &TaskQuery) -> Result<Page<Task>>;

    /// Tasks of a job in the given statuses, all tasks when `statuses` is empty
    async fn tasks_of_job(&self, job_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    async fn count_task_status(&self, job_id: &str) -> Result<Vec<TaskStatusCount>>;

    /// Jobs in [`PENDING_JOB_STATUSES`] with their non-terminal tasks, oldest first
    async fn get_pending_jobs(&self) -> Result<Vec<PendingJob>>;

    /// Cancels the unfinished tasks of a job
    ///
    /// Without `force` only `Queued` tasks are canceled, with it `Sent` and
    /// `InProgress` tasks too. Returns the number of canceled tasks.
    async fn cancel_tasks(&self, job_id: &str, force: bool) -> Result<u64>;
}

/// Statuses `cancel_tasks` moves to `Canceled`
pub fn cancelable_statuses(force: bool) -> &'static [TaskStatus] {
    if force {
        &TaskStatus::NON_TERMINAL
    } else {
        &[TaskStatus::Queued]
    }
}
