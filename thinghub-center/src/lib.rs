//! ThingHub Center
//!
//! Owns the job lifecycle: rolls tasks out to the runner under rate limits
//! and schedule windows, watches task outcomes and finalizes jobs once all
//! their tasks are terminal.
//!
//! Architecture:
//! - Center: lifecycle handle, fire-and-forget management messages and
//!   introspection over request/response channels
//! - Scheduler: the management, schedule and watcher loops
//! - Service: validated management entry point over the repository and center

pub mod center;
pub mod config;
pub mod error;
pub mod message;
mod scheduler;
pub mod service;

pub use center::Center;
pub use config::CenterConfig;
pub use error::{CenterError, ServiceError};
pub use message::MgrMsg;
pub use service::JobService;
