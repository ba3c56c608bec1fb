//! Desired state updates

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Merges a fragment into a device's desired state
#[async_trait]
pub trait DesiredStateSetter: Send + Sync {
    async fn set_desired(&self, thing_id: &str, req: DesiredStateRequest) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateRequest {
    pub client_token: String,
    pub desired: Map<String, Value>,
}
