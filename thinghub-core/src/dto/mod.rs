//! Data Transfer Objects
//!
//! Requests accepted by the management layer, validated before they reach
//! the engine, and paging types for queries.

pub mod job;
pub mod page;
pub mod task;
