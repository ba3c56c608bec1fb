//! Management loop
//!
//! Applies management messages on a bounded pool. Messages of one job run in
//! arrival order; messages of different jobs run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use thinghub_core::domain::JobId;
use thinghub_core::domain::job::JobStatus;
use thinghub_store::JobUpdate;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::schedule::PendingJobItem;
use super::{ScheduleCmd, Shared};
use crate::message::MgrMsg;

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut inbox: mpsc::UnboundedReceiver<MgrMsg>,
    shutdown: CancellationToken,
) {
    info!("Starting management loop (pool: {})", shared.config.pool_size);

    let pool = Arc::new(Semaphore::new(shared.config.pool_size));
    let mut last: HashMap<JobId, JoinHandle<()>> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = pool.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        last.retain(|_, handle| !handle.is_finished());
        let job_id = msg.job_id().to_string();
        let previous = last.remove(&job_id);
        let shared = shared.clone();

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            apply(&shared, msg).await;
            drop(permit);
        });
        last.insert(job_id, handle);
    }

    info!("Management loop stopped");
}

async fn apply(shared: &Shared, msg: MgrMsg) {
    info!(job_id = %msg.job_id(), "Applying {}", msg.kind());

    match msg {
        MgrMsg::CreateJob { context, tasks } => {
            let job_id = context.job_id.clone();
            let tasks = match shared.repo.create_tasks(tasks).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(job_id = %job_id, "Failed to create tasks: {:#}", e);
                    return;
                }
            };
            shared.contexts.set(context.clone()).await;
            shared.schedule(ScheduleCmd::Add(PendingJobItem::new(context, tasks)));
        }

        MgrMsg::UpdateJob {
            job_id,
            retry_config,
            timeout_config,
        } => {
            let found = shared
                .contexts
                .update(&job_id, |c| {
                    if let Some(retry) = retry_config {
                        c.retry_config = Some(retry);
                    }
                    if let Some(timeout) = timeout_config {
                        c.timeout_config = Some(timeout);
                    }
                })
                .await;
            if !found {
                debug!(job_id = %job_id, "No live context to update");
            }
        }

        MgrMsg::CancelJob { job_id, force } => {
            let status = if force {
                JobStatus::Canceled
            } else {
                JobStatus::Canceling
            };
            shared
                .contexts
                .update(&job_id, |c| {
                    c.status = status;
                    c.force_canceled = force;
                })
                .await;
            shared.runner.cancel_tasks_of_job(&job_id);

            match shared.repo.cancel_tasks(&job_id, force).await {
                Ok(n) => debug!(job_id = %job_id, force, "Canceled {} task(s)", n),
                Err(e) => error!(job_id = %job_id, "Failed to cancel tasks: {:#}", e),
            }

            if force {
                shared.schedule(ScheduleCmd::Remove(job_id.clone()));
                let update = JobUpdate {
                    force_canceled: Some(true),
                    ..JobUpdate::finished(JobStatus::Canceled, chrono::Utc::now())
                };
                if let Err(e) = shared.repo.update_job(&job_id, update).await {
                    error!(job_id = %job_id, "Failed to persist canceled job: {:#}", e);
                }
            }
            shared.check(&job_id);
        }

        MgrMsg::DeleteJob { job_id, force } => {
            shared
                .contexts
                .update(&job_id, |c| c.status = JobStatus::Removing)
                .await;
            shared.schedule(ScheduleCmd::Remove(job_id.clone()));
            shared.runner.delete_tasks_of_job(&job_id);

            if let Err(e) = shared.repo.cancel_tasks(&job_id, force).await {
                if e.is_not_found() {
                    warn!(job_id = %job_id, "Job vanished before delete");
                } else {
                    error!(job_id = %job_id, "Failed to cancel tasks before delete: {:#}", e);
                }
            }
            shared.check(&job_id);
        }

        MgrMsg::CancelTask { job_id, task_id } => {
            shared.schedule(ScheduleCmd::RemoveTask {
                job_id: job_id.clone(),
                task_id,
            });
            shared.runner.cancel_task(task_id);
            shared.check(&job_id);
        }

        MgrMsg::DeleteTask { job_id, task_id } => {
            shared.schedule(ScheduleCmd::RemoveTask {
                job_id: job_id.clone(),
                task_id,
            });
            shared.runner.delete_task(task_id);
            shared.check(&job_id);
        }
    }
}
