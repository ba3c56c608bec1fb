//! Device presence

use anyhow::Result;
use async_trait::async_trait;
use thinghub_core::domain::thing::PresenceEvent;
use tokio::sync::broadcast;

/// Reports whether devices are online and streams presence changes
#[async_trait]
pub trait ConnectivityChecker: Send + Sync {
    async fn is_connected(&self, thing_id: &str) -> Result<bool>;

    /// New subscription to connect and disconnect events
    fn on_connect(&self) -> broadcast::Receiver<PresenceEvent>;
}
