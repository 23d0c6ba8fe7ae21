use presence_store::{LastSeen, PlayerField};
use scc::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::ConnectionDirectory;
use crate::error::Result;
use crate::events::NetworkEvent;
use crate::message::{PresenceAction, PresenceEvent};
use crate::presence::PresenceStore;

/// What this instance currently believes about a remote player. `None` in a
/// slot means "not cached", not "absent in the store".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedPresence {
    pub server: Option<String>,
    pub proxy: Option<String>,
    pub ip: Option<IpAddr>,
    pub last_seen: Option<LastSeen>,
}

/// Read-through projection of the presence records.
///
/// Locally connected players are answered from the connection directory and
/// never reach the store. Entries are never evicted; local connects and
/// disconnects invalidate them and data-sync events overwrite them.
pub struct PresenceCache {
    proxy_id: String,
    entries: HashMap<Uuid, CachedPresence>,
    directory: Arc<dyn ConnectionDirectory>,
    store: Arc<PresenceStore>,
    events: broadcast::Sender<NetworkEvent>,
}

impl PresenceCache {
    pub fn new(
        proxy_id: impl Into<String>,
        directory: Arc<dyn ConnectionDirectory>,
        store: Arc<PresenceStore>,
        events: broadcast::Sender<NetworkEvent>,
    ) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            entries: HashMap::new(),
            directory,
            store,
            events,
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<CachedPresence> {
        self.entries.read_async(id, |_, entry| entry.clone()).await
    }

    pub async fn put(&self, id: Uuid, presence: CachedPresence) {
        self.modify(id, |entry| *entry = presence).await;
    }

    pub async fn invalidate(&self, id: &Uuid) {
        let _ = self.entries.remove_async(id).await;
    }

    pub async fn invalidate_all(&self) {
        self.entries.clear_async().await;
    }

    async fn modify<R>(&self, id: Uuid, f: impl FnOnce(&mut CachedPresence) -> R) -> R {
        let mut entry = self.entries.entry_async(id).await.or_default();
        f(entry.get_mut())
    }

    // ========================================================================
    // Read path
    // ========================================================================

    pub async fn server_of(&self, id: &Uuid) -> Result<Option<String>> {
        if let Some(live) = self.directory.live_attributes(id) {
            return Ok(live.server);
        }
        if let Some(server) = self.cached(id, |entry| entry.server.clone()).await {
            return Ok(Some(server));
        }
        let server = self.store.get_attribute(id, PlayerField::Server).await?;
        if let Some(server) = &server {
            let server = server.clone();
            self.modify(*id, |entry| entry.server = Some(server)).await;
        }
        Ok(server)
    }

    pub async fn proxy_of(&self, id: &Uuid) -> Result<Option<String>> {
        if self.directory.live_attributes(id).is_some() {
            return Ok(Some(self.proxy_id.clone()));
        }
        if let Some(proxy) = self.cached(id, |entry| entry.proxy.clone()).await {
            return Ok(Some(proxy));
        }
        let proxy = self.store.get_attribute(id, PlayerField::Proxy).await?;
        if let Some(proxy) = &proxy {
            let proxy = proxy.clone();
            self.modify(*id, |entry| entry.proxy = Some(proxy)).await;
        }
        Ok(proxy)
    }

    pub async fn ip_of(&self, id: &Uuid) -> Result<Option<IpAddr>> {
        if let Some(live) = self.directory.live_attributes(id) {
            return Ok(Some(live.ip));
        }
        if let Some(ip) = self.cached(id, |entry| entry.ip).await {
            return Ok(Some(ip));
        }
        let Some(raw) = self.store.get_attribute(id, PlayerField::Ip).await? else {
            return Ok(None);
        };
        match raw.parse::<IpAddr>() {
            Ok(ip) => {
                self.modify(*id, |entry| entry.ip = Some(ip)).await;
                Ok(Some(ip))
            }
            Err(_) => {
                warn!(%id, %raw, "stored address is not an ip");
                Ok(None)
            }
        }
    }

    /// `Online` for connected players, `Never` when no record exists.
    pub async fn last_seen_of(&self, id: &Uuid) -> Result<LastSeen> {
        if self.directory.live_attributes(id).is_some() {
            return Ok(LastSeen::Online);
        }
        if let Some(last_seen) = self.cached(id, |entry| entry.last_seen).await {
            return Ok(last_seen);
        }
        let raw = self.store.get_attribute(id, PlayerField::Online).await?;
        let last_seen = LastSeen::from_stored(raw.as_deref()).unwrap_or_else(|| {
            warn!(%id, ?raw, "unparsable last-seen value");
            LastSeen::Never
        });
        if last_seen != LastSeen::Never {
            self.modify(*id, |entry| entry.last_seen = Some(last_seen)).await;
        }
        Ok(last_seen)
    }

    async fn cached<T>(&self, id: &Uuid, slot: impl FnOnce(&CachedPresence) -> Option<T>) -> Option<T> {
        self.entries
            .read_async(id, |_, entry| slot(entry))
            .await
            .flatten()
    }

    // ========================================================================
    // Data-sync events
    // ========================================================================

    /// Fold a remote presence change into the cache and announce it.
    pub async fn apply(&self, event: PresenceEvent) {
        let PresenceEvent {
            target,
            source,
            action,
        } = event;
        debug!(%target, %source, action = action.name(), "applying presence event");

        let notification = match action {
            PresenceAction::Join { address } => {
                self.modify(target, |entry| {
                    entry.proxy = Some(source);
                    entry.last_seen = Some(LastSeen::Online);
                    entry.ip = Some(address);
                })
                .await;
                NetworkEvent::PlayerJoinedNetwork { uuid: target }
            }
            PresenceAction::Leave { timestamp } => {
                self.modify(target, |entry| {
                    *entry = CachedPresence {
                        last_seen: Some(LastSeen::At(timestamp)),
                        ..CachedPresence::default()
                    };
                })
                .await;
                NetworkEvent::PlayerLeftNetwork {
                    uuid: target,
                    timestamp,
                }
            }
            PresenceAction::ServerChange { server } => {
                let previous_server = self
                    .modify(target, |entry| entry.server.replace(server.clone()))
                    .await;
                NetworkEvent::PlayerChangedServer {
                    uuid: target,
                    previous_server,
                    server,
                }
            }
        };

        // No subscribers is fine.
        let _ = self.events.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::LocalPlayers;
    use crate::retry::ResilientOperation;
    use presence_store::MemoryBackend;
    use std::time::Duration;

    struct Fixture {
        backend: MemoryBackend,
        players: Arc<LocalPlayers>,
        store: Arc<PresenceStore>,
        cache: PresenceCache,
        events: broadcast::Receiver<NetworkEvent>,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let ops = ResilientOperation::new(Arc::new(backend.clone()), Duration::from_millis(1));
        let store = Arc::new(PresenceStore::new(ops));
        let players = Arc::new(LocalPlayers::new());
        let (tx, events) = broadcast::channel(16);
        let cache = PresenceCache::new("p1", players.clone(), store.clone(), tx);
        Fixture {
            backend,
            players,
            store,
            cache,
            events,
        }
    }

    #[tokio::test]
    async fn test_local_reads_never_touch_the_store() {
        let fx = fixture();
        let id = Uuid::new_v4();
        fx.players.connect(id, "Steve", "10.0.0.1".parse().unwrap());
        fx.players.set_server(&id, "lobby");
        let before = fx.backend.commands_issued();

        assert_eq!(fx.cache.server_of(&id).await.unwrap().as_deref(), Some("lobby"));
        assert_eq!(fx.cache.proxy_of(&id).await.unwrap().as_deref(), Some("p1"));
        assert_eq!(fx.cache.ip_of(&id).await.unwrap(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(fx.cache.last_seen_of(&id).await.unwrap(), LastSeen::Online);

        assert_eq!(fx.backend.commands_issued(), before);
    }

    #[tokio::test]
    async fn test_remote_reads_populate_cache() {
        let fx = fixture();
        let id = Uuid::new_v4();
        fx.store.set_attribute(&id, PlayerField::Server, "survival").await.unwrap();

        assert_eq!(fx.cache.server_of(&id).await.unwrap().as_deref(), Some("survival"));
        let after_first = fx.backend.commands_issued();
        assert_eq!(fx.cache.server_of(&id).await.unwrap().as_deref(), Some("survival"));

        assert_eq!(fx.backend.commands_issued(), after_first);
    }

    #[tokio::test]
    async fn test_unknown_player_has_never_been_seen() {
        let fx = fixture();
        assert_eq!(fx.cache.last_seen_of(&Uuid::new_v4()).await.unwrap(), LastSeen::Never);
    }

    #[tokio::test]
    async fn test_join_then_leave_events() {
        let mut fx = fixture();
        let id = Uuid::new_v4();

        fx.cache
            .apply(PresenceEvent::new(
                id,
                "p2",
                PresenceAction::Join {
                    address: "10.0.0.9".parse().unwrap(),
                },
            ))
            .await;
        let cached = fx.cache.get(&id).await.unwrap();
        assert_eq!(cached.proxy.as_deref(), Some("p2"));
        assert_eq!(cached.last_seen, Some(LastSeen::Online));
        assert_eq!(
            fx.events.recv().await.unwrap(),
            NetworkEvent::PlayerJoinedNetwork { uuid: id }
        );

        fx.cache
            .apply(PresenceEvent::new(id, "p2", PresenceAction::Leave { timestamp: 20_000 }))
            .await;
        let cached = fx.cache.get(&id).await.unwrap();
        assert_eq!(cached.proxy, None);
        assert_eq!(cached.ip, None);
        assert_eq!(fx.cache.last_seen_of(&id).await.unwrap(), LastSeen::At(20_000));
        assert_eq!(
            fx.events.recv().await.unwrap(),
            NetworkEvent::PlayerLeftNetwork {
                uuid: id,
                timestamp: 20_000
            }
        );
    }

    #[tokio::test]
    async fn test_server_change_keeps_proxy_slot() {
        let mut fx = fixture();
        let id = Uuid::new_v4();
        fx.cache
            .put(
                id,
                CachedPresence {
                    server: Some("lobby".to_string()),
                    proxy: Some("p2".to_string()),
                    ..CachedPresence::default()
                },
            )
            .await;

        fx.cache
            .apply(PresenceEvent::new(
                id,
                "p2",
                PresenceAction::ServerChange {
                    server: "survival".to_string(),
                },
            ))
            .await;

        let cached = fx.cache.get(&id).await.unwrap();
        assert_eq!(cached.server.as_deref(), Some("survival"));
        assert_eq!(cached.proxy.as_deref(), Some("p2"));
        assert_eq!(
            fx.events.recv().await.unwrap(),
            NetworkEvent::PlayerChangedServer {
                uuid: id,
                previous_server: Some("lobby".to_string()),
                server: "survival".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_invalidate_forces_store_read() {
        let fx = fixture();
        let id = Uuid::new_v4();
        fx.cache
            .put(
                id,
                CachedPresence {
                    server: Some("stale".to_string()),
                    ..CachedPresence::default()
                },
            )
            .await;

        fx.cache.invalidate(&id).await;
        assert_eq!(fx.cache.server_of(&id).await.unwrap(), None);

        fx.cache.put(id, CachedPresence::default()).await;
        fx.cache.invalidate_all().await;
        assert!(fx.cache.get(&id).await.is_none());
    }
}
