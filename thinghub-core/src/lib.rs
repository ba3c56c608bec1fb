//! ThingHub Core
//!
//! Core types shared by the job scheduling engine of the ThingHub IoT hub.
//!
//! This crate contains:
//! - Domain types: Job, Task, their state machines and scheduling configs
//! - DTOs: management requests, paging and their validation rules

pub mod domain;
pub mod dto;
pub mod error;
pub mod validation;

pub use error::ValidationError;
