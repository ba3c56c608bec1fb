//! ThingHub Runner
//!
//! Executes job tasks against devices without blocking the center.
//!
//! Architecture:
//! - Queue: status-then-age priority queue of undispatched tasks
//! - Actions: one executor per system operation, outcomes never error
//! - Services: collaborator traits for method calls, desired state and presence
//! - Scheduler: the dispatch loop and the outcome loop
//!
//! Tasks arrive through [`Runner::put_tasks`], are dispatched on a bounded
//! worker pool and their outcomes are persisted and streamed back to the
//! center.

pub mod action;
pub mod config;
pub mod context;
pub mod error;
pub mod queue;
pub mod runner;
mod scheduler;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::RunnerConfig;
pub use context::JobContexts;
pub use error::RunnerError;
pub use queue::TaskQueue;
pub use runner::Runner;
pub use service::Collaborators;
