//! ThingHub Store
//!
//! Persistence contract of the job engine and its implementations.

pub mod db;
pub mod error;
pub mod repository;
pub mod update;

pub use error::StoreError;
pub use repository::{JobRepository, MemoryRepository, PendingJob, PgRepository};
pub use update::{JobUpdate, TaskUpdate};
