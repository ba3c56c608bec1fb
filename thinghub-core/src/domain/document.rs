//! Job documents
//!
//! A job document is schema-less on the wire. Its shape depends on the job's
//! operation: reserved operations decode into typed requests, custom
//! operations keep the opaque payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::Operation;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobDocument {
    InvokeMethod(InvokeMethodRequest),
    UpdateDesired(UpdateDesiredRequest),
    Custom(Value),
}

/// `{"method": .., "responseTimeout": .., "data": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeMethodRequest {
    pub method: String,
    /// Seconds to wait for the device, zero leaves it to the transport
    #[serde(default)]
    pub response_timeout: u32,
    #[serde(default)]
    pub data: Value,
}

/// `{"state": {"desired": {..}}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDesiredRequest {
    pub state: DesiredState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub desired: serde_json::Map<String, Value>,
}

impl JobDocument {
    /// Decodes a raw document against the operation it belongs to
    ///
    /// Reserved operations require a document; custom operations accept none
    /// and then carry `null`.
    pub fn decode(operation: &Operation, raw: Option<&Value>) -> Result<Self, serde_json::Error> {
        match operation {
            Operation::InvokeMethod => {
                let raw = raw.cloned().unwrap_or(Value::Null);
                Ok(JobDocument::InvokeMethod(serde_json::from_value(raw)?))
            }
            Operation::UpdateDesired => {
                let raw = raw.cloned().unwrap_or(Value::Null);
                Ok(JobDocument::UpdateDesired(serde_json::from_value(raw)?))
            }
            Operation::Custom(_) => Ok(JobDocument::Custom(raw.cloned().unwrap_or(Value::Null))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JobDocument::InvokeMethod(req) => serde_json::to_value(req).unwrap_or(Value::Null),
            JobDocument::UpdateDesired(req) => serde_json::to_value(req).unwrap_or(Value::Null),
            JobDocument::Custom(value) => value.clone(),
        }
    }
}
