//! Thing presence

use serde::{Deserialize, Serialize};

use super::ThingId;

/// Change of a thing's network connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub thing_id: ThingId,
    pub event_type: PresenceEventType,
}

impl PresenceEvent {
    pub fn connected(thing_id: impl Into<ThingId>) -> Self {
        Self {
            thing_id: thing_id.into(),
            event_type: PresenceEventType::Connected,
        }
    }

    pub fn disconnected(thing_id: impl Into<ThingId>) -> Self {
        Self {
            thing_id: thing_id.into(),
            event_type: PresenceEventType::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEventType {
    Connected,
    Disconnected,
}
