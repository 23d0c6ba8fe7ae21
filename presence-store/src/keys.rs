//! Keyspace and channel names shared by every proxy instance.

/// Hash of proxy id -> epoch millis of its last heartbeat.
pub const HEARTBEATS: &str = "heartbeats";

/// Hash of player uuid -> last known name.
pub const IDENTITY_BY_ID: &str = "identity:ids";

/// Hash of lowercase player name -> uuid.
pub const IDENTITY_BY_NAME: &str = "identity:names";

/// Channel every instance listens on for broadcast commands.
pub const BROADCAST_CHANNEL: &str = "presence-allservers";

/// Channel carrying JOIN / LEAVE / SERVER_CHANGE announcements.
pub const DATA_CHANNEL: &str = "presence-data";

/// Target name accepted by proxy commands meaning "every proxy".
pub const ALL_PROXIES: &str = "allservers";

/// Set of player ids currently claimed by `proxy_id`.
pub fn online_set(proxy_id: &str) -> String {
    format!("proxy:{proxy_id}:usersOnline")
}

/// Presence record hash for one player.
pub fn player(id: &str) -> String {
    format!("player:{id}")
}

/// Channel addressed to a single proxy.
pub fn addressed_channel(proxy_id: &str) -> String {
    format!("presence-{proxy_id}")
}
