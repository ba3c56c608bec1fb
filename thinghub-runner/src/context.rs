//! Shared job contexts
//!
//! The only state touched by more than one loop: the center writes contexts,
//! the runner's dispatch loop and workers read them.

use std::collections::HashMap;
use std::sync::Arc;
use thinghub_core::domain::context::JobContext;
use tokio::sync::RwLock;
use tracing::debug;

/// Job id to [`JobContext`] map behind a read/write lock
#[derive(Clone, Default)]
pub struct JobContexts {
    inner: Arc<RwLock<HashMap<String, JobContext>>>,
}

impl JobContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &str) -> Option<JobContext> {
        self.inner.read().await.get(job_id).cloned()
    }

    pub async fn set(&self, ctx: JobContext) {
        debug!(job_id = %ctx.job_id, "set job context");
        self.inner.write().await.insert(ctx.job_id.clone(), ctx);
    }

    /// Mutates a context in place, returns false when absent
    pub async fn update(&self, job_id: &str, f: impl FnOnce(&mut JobContext)) -> bool {
        match self.inner.write().await.get_mut(job_id) {
            Some(ctx) => {
                f(ctx);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobContext> {
        debug!(job_id, "remove job context");
        self.inner.write().await.remove(job_id)
    }

    pub async fn snapshot(&self) -> Vec<JobContext> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
