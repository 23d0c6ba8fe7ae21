//! Wire format of the data-sync channel.
//!
//! ```json
//! {"action":"JOIN","source":"proxy-a","target":"<uuid>","payload":{"address":"10.0.0.7"}}
//! ```
//!
//! The envelope is decoded first and the payload only once the action is
//! known, so an unrecognized action can be told apart from broken JSON.

use serde::Deserialize;
use serde_json::{Value, json};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A presence change announced by one proxy to all others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub target: Uuid,
    pub source: String,
    pub action: PresenceAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    Join { address: IpAddr },
    Leave { timestamp: i64 },
    ServerChange { server: String },
}

impl PresenceAction {
    pub fn name(&self) -> &'static str {
        match self {
            PresenceAction::Join { .. } => "JOIN",
            PresenceAction::Leave { .. } => "LEAVE",
            PresenceAction::ServerChange { .. } => "SERVER_CHANGE",
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    source: String,
    target: Uuid,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct JoinPayload {
    address: IpAddr,
}

#[derive(Deserialize)]
struct LeavePayload {
    timestamp: i64,
}

#[derive(Deserialize)]
struct ServerChangePayload {
    server: String,
}

impl PresenceEvent {
    pub fn new(target: Uuid, source: impl Into<String>, action: PresenceAction) -> Self {
        Self {
            target,
            source: source.into(),
            action,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let action = match envelope.action.as_str() {
            "JOIN" => {
                let payload: JoinPayload = serde_json::from_value(envelope.payload)?;
                PresenceAction::Join {
                    address: payload.address,
                }
            }
            "LEAVE" => {
                let payload: LeavePayload = serde_json::from_value(envelope.payload)?;
                PresenceAction::Leave {
                    timestamp: payload.timestamp,
                }
            }
            "SERVER_CHANGE" => {
                let payload: ServerChangePayload = serde_json::from_value(envelope.payload)?;
                PresenceAction::ServerChange {
                    server: payload.server,
                }
            }
            _ => return Err(MessageError::UnknownAction(envelope.action)),
        };
        Ok(Self {
            target: envelope.target,
            source: envelope.source,
            action,
        })
    }

    pub fn encode(&self) -> String {
        let payload = match &self.action {
            PresenceAction::Join { address } => json!({ "address": address.to_string() }),
            PresenceAction::Leave { timestamp } => json!({ "timestamp": timestamp }),
            PresenceAction::ServerChange { server } => json!({ "server": server }),
        };
        json!({
            "action": self.action.name(),
            "source": self.source,
            "target": self.target,
            "payload": payload,
        })
        .to_string()
    }
}
