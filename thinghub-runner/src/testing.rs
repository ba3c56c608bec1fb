//! Mock collaborators and fixtures for tests
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream test suites.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thinghub_core::domain::TaskId;
use thinghub_core::domain::context::JobContext;
use thinghub_core::domain::document::{InvokeMethodRequest, JobDocument};
use thinghub_core::domain::job::{Job, JobStatus, Operation, TargetConfig};
use thinghub_core::domain::task::{StatusDetails, Task, TaskStatus};
use thinghub_core::domain::thing::PresenceEvent;
use tokio::sync::broadcast;

use crate::service::{
    Collaborators, ConnectivityChecker, DesiredStateRequest, DesiredStateSetter, MethodInvoker,
    MethodRequest, MethodResponse,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Method invoker answering from a per-thing script, 200 for unscripted things
#[derive(Default)]
pub struct ScriptedInvoker {
    codes: HashMap<String, Vec<i64>>,
    errors: HashMap<String, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<MethodRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(self, thing_id: &str, code: i64) -> Self {
        self.with_sequence(thing_id, vec![code])
    }

    /// One code per call, the last one repeats
    pub fn with_sequence(mut self, thing_id: &str, codes: Vec<i64>) -> Self {
        self.codes.insert(thing_id.to_string(), codes);
        self
    }

    pub fn with_error(mut self, thing_id: &str, message: &str) -> Self {
        self.errors.insert(thing_id.to_string(), message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<MethodRequest> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, thing_id: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.thing_id == thing_id).count()
    }
}

#[async_trait]
impl MethodInvoker for ScriptedInvoker {
    async fn invoke_method(&self, req: MethodRequest) -> Result<MethodResponse> {
        let thing_id = req.thing_id.clone();
        let previous = {
            let mut calls = lock(&self.calls);
            let previous = calls.iter().filter(|c| c.thing_id == thing_id).count();
            calls.push(req);
            previous
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.errors.get(&thing_id) {
            return Err(anyhow!("{message}"));
        }

        let code = self
            .codes
            .get(&thing_id)
            .and_then(|codes| codes.get(previous).or(codes.last()))
            .copied()
            .unwrap_or(200);
        Ok(MethodResponse {
            code,
            message: if code == 200 { "ok".to_string() } else { "error".to_string() },
            data: Value::Null,
        })
    }
}

#[derive(Default)]
pub struct RecordingDesiredSetter {
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingDesiredSetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, thing_id: &str) -> Self {
        self.failing.insert(thing_id.to_string());
        self
    }

    /// `(thing_id, desired)` per call
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl DesiredStateSetter for RecordingDesiredSetter {
    async fn set_desired(&self, thing_id: &str, req: DesiredStateRequest) -> Result<()> {
        lock(&self.calls).push((thing_id.to_string(), Value::Object(req.desired)));
        if self.failing.contains(thing_id) {
            return Err(anyhow!("shadow store rejected {thing_id}"));
        }
        Ok(())
    }
}

/// Connectivity with togglable things, every thing starts online
pub struct SwitchableConnectivity {
    offline: Mutex<HashSet<String>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Default for SwitchableConnectivity {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            offline: Mutex::new(HashSet::new()),
            events,
        }
    }
}

impl SwitchableConnectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, thing_id: &str) {
        lock(&self.offline).insert(thing_id.to_string());
        let _ = self.events.send(PresenceEvent::disconnected(thing_id));
    }

    /// Marks the thing online without publishing an event
    pub fn restore(&self, thing_id: &str) {
        lock(&self.offline).remove(thing_id);
    }

    /// Marks the thing online and publishes a connected event
    pub fn connect(&self, thing_id: &str) {
        lock(&self.offline).remove(thing_id);
        let _ = self.events.send(PresenceEvent::connected(thing_id));
    }
}

#[async_trait]
impl ConnectivityChecker for SwitchableConnectivity {
    async fn is_connected(&self, thing_id: &str) -> Result<bool> {
        Ok(!lock(&self.offline).contains(thing_id))
    }

    fn on_connect(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

/// The mocks behind one [`Collaborators`] set, kept typed for assertions
pub struct Mocks {
    pub invoker: Arc<ScriptedInvoker>,
    pub desired: Arc<RecordingDesiredSetter>,
    pub connectivity: Arc<SwitchableConnectivity>,
}

impl Mocks {
    pub fn new(invoker: ScriptedInvoker) -> Self {
        Self {
            invoker: Arc::new(invoker),
            desired: Arc::new(RecordingDesiredSetter::new()),
            connectivity: Arc::new(SwitchableConnectivity::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            invoker: self.invoker.clone(),
            desired: self.desired.clone(),
            connectivity: self.connectivity.clone(),
        }
    }
}

/// A queued remote procedure task
pub fn task(task_id: TaskId, job_id: &str, thing_id: &str) -> Task {
    let now = Utc::now();
    Task {
        task_id,
        job_id: job_id.to_string(),
        thing_id: thing_id.to_string(),
        operation: Operation::InvokeMethod,
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
    }
}

/// A stored remote procedure job calling `reboot`, matching [`context`]
pub fn job(job_id: &str) -> Job {
    let now = Utc::now();
    Job {
        job_id: job_id.to_string(),
        operation: Operation::InvokeMethod,
        target_config: TargetConfig::things(["d1"]),
        job_doc: Some(serde_json::json!({"method": "reboot", "responseTimeout": 5})),
        description: String::new(),
        scheduling_config: None,
        rollout_config: None,
        retry_config: None,
        timeout_config: None,
        status: JobStatus::InProgress,
        force_canceled: false,
        comment: String::new(),
        reason_code: String::new(),
        started_at: Some(now),
        completed_at: None,
        created_at: now,
        updated_at: now,
        version: 1,
    }
}

/// An in-progress remote procedure job calling `reboot`
pub fn context(job_id: &str) -> JobContext {
    JobContext {
        job_id: job_id.to_string(),
        operation: Operation::InvokeMethod,
        job_doc: JobDocument::InvokeMethod(InvokeMethodRequest {
            method: "reboot".to_string(),
            response_timeout: 5,
            data: Value::Null,
        }),
        scheduling_config: None,
        rollout_config: None,
        retry_config: None,
        timeout_config: None,
        status: JobStatus::InProgress,
        force_canceled: false,
        started_at: Some(Utc::now()),
    }
}
