//! Core domain types
//!
//! These types are shared between the store (for persistence), the runner
//! (for execution) and the center (for scheduling).

pub mod config;
pub mod context;
pub mod document;
pub mod job;
pub mod task;
pub mod thing;

/// Job identifier, caller supplied or generated
pub type JobId = String;

/// Task identifier, assigned by storage
pub type TaskId = i64;

/// Thing (device) identifier
pub type ThingId = String;
