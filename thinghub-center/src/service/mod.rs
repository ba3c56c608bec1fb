//! Service layer
//!
//! Validated management entry point above the center.

pub mod job;

pub use job::JobService;
