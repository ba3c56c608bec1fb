//! Validation rules for management requests

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::domain::config::{FailureType, RetryConfig, RolloutConfig, SchedulingConfig, TimeoutConfig};
use crate::domain::document::JobDocument;
use crate::domain::job::{Operation, TargetConfig, TargetType};
use crate::error::ValidationError;

const ID_PATTERN: &str = "^[0-9a-zA-Z_-]{1,64}$";

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(ID_PATTERN).expect("valid regex"));

pub const MAX_DESCRIPTION_CHARS: usize = 250;
pub const MAX_JOB_DOC_BYTES: usize = 60_000;
pub const MAX_REASON_CODE_CHARS: usize = 64;
pub const MAX_COMMENT_CHARS: usize = 250;
pub const MAX_ROLLOUT_PER_MINUTE: u32 = 1000;
pub const MAX_IN_PROGRESS_MINUTES: u32 = 10_080;
pub const MAX_RETRIES: u8 = 10;

pub fn job_id(id: &str) -> Result<(), ValidationError> {
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ValidationError::invalid("jobId", format!("should match {ID_PATTERN}")))
    }
}

/// Parses an operation name; custom names share the job id alphabet
pub fn operation(name: &str) -> Result<Operation, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Missing { field: "operation" });
    }
    let op = Operation::from(name);
    if let Operation::Custom(custom) = &op {
        if custom.starts_with('$') {
            return Err(ValidationError::invalid(
                "operation",
                "only reserved operations may start with '$'",
            ));
        }
        if !ID_RE.is_match(custom) {
            return Err(ValidationError::invalid("operation", format!("should match {ID_PATTERN}")));
        }
    }
    Ok(op)
}

pub fn description(text: &str) -> Result<(), ValidationError> {
    max_chars("description", text, MAX_DESCRIPTION_CHARS)
}

pub fn job_doc(op: &Operation, raw: Option<&Value>) -> Result<(), ValidationError> {
    if let Some(raw) = raw {
        let size = serde_json::to_vec(raw)
            .map_err(|e| ValidationError::invalid("jobDoc", e.to_string()))?
            .len();
        if size > MAX_JOB_DOC_BYTES {
            return Err(ValidationError::TooLong {
                field: "jobDoc",
                max: MAX_JOB_DOC_BYTES,
                unit: "bytes",
            });
        }
    }
    JobDocument::decode(op, raw)
        .map(|_| ())
        .map_err(|e| ValidationError::invalid("jobDoc", e.to_string()))
}

pub fn target(config: &TargetConfig) -> Result<(), ValidationError> {
    match config.target_type {
        TargetType::ThingId => {}
    }
    if config.things.is_empty() {
        return Err(ValidationError::Missing { field: "targetConfig.things" });
    }
    let mut seen = HashSet::new();
    for thing in &config.things {
        if thing.is_empty() {
            return Err(ValidationError::invalid("targetConfig.things", "empty thing id"));
        }
        if !seen.insert(thing.as_str()) {
            return Err(ValidationError::invalid(
                "targetConfig.things",
                format!("duplicated thing id {thing}"),
            ));
        }
    }
    Ok(())
}

pub fn scheduling(config: &SchedulingConfig) -> Result<(), ValidationError> {
    if let Some(end) = config.end_time {
        if config.start_time > end {
            return Err(ValidationError::invalid(
                "schedulingConfig",
                "startTime should be before endTime",
            ));
        }
    }
    Ok(())
}

pub fn rollout(config: &RolloutConfig) -> Result<(), ValidationError> {
    in_range(
        "rolloutConfig.maxPerMinute",
        config.max_per_minute as i64,
        1,
        MAX_ROLLOUT_PER_MINUTE as i64,
    )
}

pub fn timeout(config: &TimeoutConfig) -> Result<(), ValidationError> {
    in_range(
        "timeoutConfig.inProgressMinutes",
        config.in_progress_minutes as i64,
        1,
        MAX_IN_PROGRESS_MINUTES as i64,
    )
}

pub fn retry(config: &RetryConfig) -> Result<(), ValidationError> {
    let count = config.criteria_list.len();
    if count == 0 || count > 2 {
        return Err(ValidationError::OutOfRange {
            field: "retryConfig.criteriaList",
            min: 1,
            max: 2,
            value: count as i64,
        });
    }
    let mut seen = HashSet::new();
    for criteria in &config.criteria_list {
        in_range(
            "retryConfig.numberOfRetries",
            criteria.number_of_retries as i64,
            0,
            MAX_RETRIES as i64,
        )?;
        if !seen.insert(criteria.failure_type) {
            return Err(ValidationError::invalid(
                "retryConfig.failureType",
                format!("duplicated failure type {:?}", criteria.failure_type),
            ));
        }
    }
    if seen.len() > 1 && seen.contains(&FailureType::All) {
        return Err(ValidationError::invalid(
            "retryConfig.failureType",
            "ALL cannot be combined with other failure types",
        ));
    }
    Ok(())
}

pub fn comment(text: &str) -> Result<(), ValidationError> {
    max_chars("comment", text, MAX_COMMENT_CHARS)
}

pub fn reason_code(text: &str) -> Result<(), ValidationError> {
    max_chars("reasonCode", text, MAX_REASON_CODE_CHARS)
}

fn max_chars(field: &'static str, text: &str, max: usize) -> Result<(), ValidationError> {
    if text.chars().count() > max {
        Err(ValidationError::TooLong {
            field,
            max,
            unit: "characters",
        })
    } else {
        Ok(())
    }
}

fn in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    } else {
        Ok(())
    }
}
