//! Collaborators the engine consumes from its host proxy.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::info;
use uuid::Uuid;

/// Live state of a locally connected player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveAttributes {
    pub name: String,
    pub server: Option<String>,
    pub ip: IpAddr,
}

/// The proxy's own view of its connections. Reads must be cheap and must not
/// block; the engine calls them on every query.
pub trait ConnectionDirectory: Send + Sync {
    fn local_ids(&self) -> HashSet<Uuid>;

    fn live_attributes(&self, id: &Uuid) -> Option<LiveAttributes>;
}

/// Executes remote command text received on the addressed or broadcast channel.
#[async_trait]
pub trait CommandDispatch: Send + Sync {
    async fn execute(&self, command: &str);
}

/// Authoritative uuid <-> name service consulted when nothing is stored.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn name_for(&self, id: &Uuid) -> anyhow::Result<Option<String>>;

    /// The id owning `name`, with the name in its canonical casing.
    async fn id_for(&self, name: &str) -> anyhow::Result<Option<(Uuid, String)>>;
}

/// Concurrent map of local connections, for hosts without their own registry.
#[derive(Default)]
pub struct LocalPlayers {
    players: DashMap<Uuid, LiveAttributes>,
}

impl LocalPlayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, id: Uuid, name: &str, ip: IpAddr) {
        self.players.insert(
            id,
            LiveAttributes {
                name: name.to_string(),
                server: None,
                ip,
            },
        );
    }

    pub fn disconnect(&self, id: &Uuid) -> Option<LiveAttributes> {
        self.players.remove(id).map(|(_, attributes)| attributes)
    }

    /// Returns the previous server, or `None` if the player is not connected.
    pub fn set_server(&self, id: &Uuid, server: &str) -> Option<Option<String>> {
        self.players
            .get_mut(id)
            .map(|mut entry| entry.server.replace(server.to_string()))
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl ConnectionDirectory for LocalPlayers {
    fn local_ids(&self) -> HashSet<Uuid> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }

    fn live_attributes(&self, id: &Uuid) -> Option<LiveAttributes> {
        self.players.get(id).map(|entry| entry.value().clone())
    }
}

/// Dispatcher that only logs the commands it receives.
pub struct LogDispatch;

#[async_trait]
impl CommandDispatch for LogDispatch {
    async fn execute(&self, command: &str) {
        info!(%command, "received remote command");
    }
}
