//! Remote procedure invocation

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Invokes a named method on a device and waits for its response
///
/// Response timeouts are enforced by the implementation and surface as errors.
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    async fn invoke_method(&self, req: MethodRequest) -> Result<MethodResponse>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodRequest {
    pub thing_id: String,
    pub method: String,
    pub response_timeout: Duration,
    pub client_token: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}
