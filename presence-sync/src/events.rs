use serde::Serialize;
use uuid::Uuid;

/// Notifications raised after the local view of the network changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    PlayerJoinedNetwork {
        uuid: Uuid,
    },
    PlayerLeftNetwork {
        uuid: Uuid,
        timestamp: i64,
    },
    PlayerChangedServer {
        uuid: Uuid,
        previous_server: Option<String>,
        server: String,
    },
    /// Any non-blank message received on a subscribed channel.
    PubSubMessage {
        channel: String,
        message: String,
    },
}

impl NetworkEvent {
    /// Player the event is about, if any.
    pub fn player(&self) -> Option<Uuid> {
        match self {
            NetworkEvent::PlayerJoinedNetwork { uuid }
            | NetworkEvent::PlayerLeftNetwork { uuid, .. }
            | NetworkEvent::PlayerChangedServer { uuid, .. } => Some(*uuid),
            NetworkEvent::PubSubMessage { .. } => None,
        }
    }
}
