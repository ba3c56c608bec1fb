//! In-memory repository

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use thinghub_core::domain::TaskId;
use thinghub_core::domain::job::{Job, JobStatus};
use thinghub_core::domain::task::{NewTask, StatusDetails, Task, TaskStatus, TaskStatusCount};
use thinghub_core::dto::job::JobQuery;
use thinghub_core::dto::page::Page;
use thinghub_core::dto::task::TaskQuery;
use tokio::sync::Mutex;

use super::{JobRepository, PENDING_JOB_STATUSES, PendingJob, cancelable_statuses};
use crate::error::{Result, StoreError};
use crate::update::{JobUpdate, TaskUpdate, ensure_not_terminal};

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    tasks: BTreeMap<TaskId, Task>,
    next_task_id: TaskId,
}

/// Repository keeping every record in process memory
///
/// A single lock around all records makes each call one transaction.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.job_id) {
            return Err(StoreError::Duplicated(job.job_id.clone()));
        }
        state.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        update.apply(job, Utc::now())?;
        Ok(job.clone())
    }

    async fn delete_job(&self, job_id: &str, force: bool) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if !force && job.status == JobStatus::InProgress {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is in progress, delete requires force"
            )));
        }
        state.tasks.retain(|_, t| t.job_id != job_id);
        state
            .jobs
            .remove(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Page<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| query.status.is_none_or(|s| j.status == s))
            .filter(|j| query.operation.as_ref().is_none_or(|op| &j.operation == op))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(Page::from_vec(jobs, query.page))
    }

    async fn create_tasks(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>> {
        let mut state = self.state.lock().await;
        if let Some(missing) = tasks.iter().find(|t| !state.jobs.contains_key(&t.job_id)) {
            return Err(StoreError::JobNotFound(missing.job_id.clone()));
        }
        let now = Utc::now();
        let mut created = Vec::with_capacity(tasks.len());
        for new in tasks {
            state.next_task_id += 1;
            let task = Task {
                task_id: state.next_task_id,
                job_id: new.job_id,
                thing_id: new.thing_id,
                operation: new.operation,
                status: TaskStatus::Queued,
                progress: 0,
                status_details: StatusDetails::new(),
                force_canceled: false,
                retry_attempt: 0,
                queued_at: now,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
                version: 1,
            };
            state.tasks.insert(task.task_id, task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        update.apply(task, Utc::now())?;
        Ok(task.clone())
    }

    async fn transition_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        ensure_not_terminal(task)?;
        update.apply(task, Utc::now())?;
        Ok(task.clone())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<Task> {
        self.state
            .lock()
            .await
            .tasks
            .remove(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Page<Task>> {
        let state = self.state.lock().await;
        let tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| query.job_id.as_ref().is_none_or(|id| &t.job_id == id))
            .filter(|t| query.thing_id.as_ref().is_none_or(|id| &t.thing_id == id))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        Ok(Page::from_vec(tasks, query.page))
    }

    async fn tasks_of_job(&self, job_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn count_task_status(&self, job_id: &str) -> Result<Vec<TaskStatusCount>> {
        let state = self.state.lock().await;
        let mut counts: Vec<TaskStatusCount> = Vec::new();
        for task in state.tasks.values().filter(|t| t.job_id == job_id) {
            match counts.iter_mut().find(|c| c.status == task.status) {
                Some(c) => c.count += 1,
                None => counts.push(TaskStatusCount {
                    status: task.status,
                    count: 1,
                }),
            }
        }
        Ok(counts)
    }

    async fn get_pending_jobs(&self) -> Result<Vec<PendingJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| PENDING_JOB_STATUSES.contains(&j.status))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs
            .into_iter()
            .map(|job| PendingJob {
                job: job.clone(),
                tasks: state
                    .tasks
                    .values()
                    .filter(|t| t.job_id == job.job_id && !t.status.is_terminal())
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    async fn cancel_tasks(&self, job_id: &str, force: bool) -> Result<u64> {
        let mut state = self.state.lock().await;
        let statuses = cancelable_statuses(force);
        let update = TaskUpdate {
            status: Some(TaskStatus::Canceled),
            force_canceled: Some(force),
            ..Default::default()
        };
        let now = Utc::now();
        let mut canceled = 0;
        for task in state
            .tasks
            .values_mut()
            .filter(|t| t.job_id == job_id && statuses.contains(&t.status))
        {
            update.apply(task, now)?;
            canceled += 1;
        }
        Ok(canceled)
    }
}
