//! Typed access to the shared presence keyspace.
//!
//! Every method is a single [`ResilientOperation::run`] call, so a compound
//! write (connect, disconnect, cleanup) uses one pooled connection and is
//! retried as a whole.

use presence_store::{PlayerField, keys};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::helpers::now_millis;
use crate::retry::ResilientOperation;

/// A proxy whose heartbeat is younger than this is considered alive.
pub const ACTIVE_WINDOW_MS: i64 = 30_000;

/// Number of roster polls between two rounds of stale-heartbeat warnings.
const STALE_WARNING_EVERY: i32 = 10;

/// Fields removed from a presence record when its player goes offline.
const SESSION_FIELDS: [&str; 3] = ["server", "ip", "proxy"];

pub struct PresenceStore {
    ops: ResilientOperation,
    stale_nag: AtomicI32,
}

impl PresenceStore {
    pub fn new(ops: ResilientOperation) -> Self {
        Self {
            ops,
            stale_nag: AtomicI32::new(0),
        }
    }

    pub fn operations(&self) -> &ResilientOperation {
        &self.ops
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    /// Write the current time under this proxy's heartbeat entry.
    pub async fn register_heartbeat(&self, proxy_id: &str) -> Result<()> {
        self.write_heartbeat(proxy_id, now_millis()).await
    }

    /// Write an explicit heartbeat timestamp (epoch millis).
    pub async fn write_heartbeat(&self, proxy_id: &str, millis: i64) -> Result<()> {
        self.ops
            .run(|conn| {
                let field = proxy_id.to_string();
                let stamp = millis.to_string();
                Box::pin(async move { conn.hset(keys::HEARTBEATS, &field, &stamp).await })
            })
            .await
    }

    /// Last heartbeat of a proxy. Unparsable entries read as absent.
    pub async fn heartbeat_of(&self, proxy_id: &str) -> Result<Option<i64>> {
        let raw = self
            .ops
            .run(|conn| {
                let field = proxy_id.to_string();
                Box::pin(async move { conn.hget(keys::HEARTBEATS, &field).await })
            })
            .await?;
        Ok(raw.and_then(|value| value.trim().parse().ok()))
    }

    pub async fn remove_heartbeat(&self, proxy_id: &str) -> Result<()> {
        self.ops
            .run(|conn| {
                let field = proxy_id.to_string();
                Box::pin(async move { conn.hdel(keys::HEARTBEATS, &[field.as_str()]).await })
            })
            .await
    }

    /// Proxies whose heartbeat is younger than [`ACTIVE_WINDOW_MS`], sorted.
    pub async fn list_active_proxies(&self) -> Result<Vec<String>> {
        let entries = self
            .ops
            .run(|conn| Box::pin(async move { conn.hgetall(keys::HEARTBEATS).await }))
            .await?;
        Ok(self.filter_active(entries, now_millis()))
    }

    fn filter_active(&self, entries: HashMap<String, String>, now: i64) -> Vec<String> {
        let nag = self.stale_nag.fetch_sub(1, Ordering::SeqCst) - 1;
        if nag <= 0 {
            self.stale_nag.store(STALE_WARNING_EVERY, Ordering::SeqCst);
        }

        let mut active = Vec::with_capacity(entries.len());
        for (proxy_id, raw) in entries {
            let Ok(stamp) = raw.trim().parse::<i64>() else {
                continue;
            };
            if now - stamp < ACTIVE_WINDOW_MS {
                active.push(proxy_id);
            } else if nag <= 0 {
                warn!(
                    %proxy_id,
                    behind_ms = now - stamp,
                    "proxy heartbeat is stale (clock skew or proxy down?)"
                );
            }
        }
        active.sort();
        active
    }

    // ========================================================================
    // Online sets
    // ========================================================================

    pub async fn add_to_online_set(&self, proxy_id: &str, id: &Uuid) -> Result<()> {
        self.ops
            .run(|conn| {
                let key = keys::online_set(proxy_id);
                let member = id.to_string();
                Box::pin(async move { conn.sadd(&key, &member).await })
            })
            .await
    }

    pub async fn remove_from_online_set(&self, proxy_id: &str, id: &Uuid) -> Result<()> {
        self.ops
            .run(|conn| {
                let key = keys::online_set(proxy_id);
                let member = id.to_string();
                Box::pin(async move { conn.srem(&key, &member).await })
            })
            .await
    }

    /// Members of one proxy's online set.
    pub async fn online_set(&self, proxy_id: &str) -> Result<HashSet<Uuid>> {
        let members = self
            .ops
            .run(|conn| {
                let key = keys::online_set(proxy_id);
                Box::pin(async move { conn.smembers(&key).await })
            })
            .await?;
        Ok(parse_ids(members))
    }

    pub async fn is_in_online_set(&self, proxy_id: &str, id: &Uuid) -> Result<bool> {
        self.ops
            .run(|conn| {
                let key = keys::online_set(proxy_id);
                let member = id.to_string();
                Box::pin(async move { conn.sismember(&key, &member).await })
            })
            .await
    }

    /// Union of the online sets of every proxy in `roster` except `exclude`.
    pub async fn union_online_players(
        &self,
        roster: &[String],
        exclude: &str,
    ) -> Result<HashSet<Uuid>> {
        let set_keys: Vec<String> = roster
            .iter()
            .filter(|proxy| proxy.as_str() != exclude)
            .map(|proxy| keys::online_set(proxy))
            .collect();
        if set_keys.is_empty() {
            return Ok(HashSet::new());
        }

        let members = self
            .ops
            .run(|conn| {
                let set_keys = set_keys.clone();
                Box::pin(async move { conn.sunion(&set_keys).await })
            })
            .await?;
        Ok(parse_ids(members))
    }

    /// Sum of the online set sizes of every proxy in `roster`.
    pub async fn count_online(&self, roster: &[String]) -> Result<usize> {
        self.ops
            .run(|conn| {
                let set_keys: Vec<String> = roster.iter().map(|p| keys::online_set(p)).collect();
                Box::pin(async move {
                    let mut count = 0;
                    for key in &set_keys {
                        count += conn.scard(key).await?;
                    }
                    Ok(count)
                })
            })
            .await
    }

    /// Whether `id` is claimed by any proxy in `roster` other than `exclude`.
    pub async fn online_elsewhere(&self, roster: &[String], exclude: &str, id: &Uuid) -> Result<bool> {
        self.ops
            .run(|conn| {
                let set_keys: Vec<String> = roster
                    .iter()
                    .filter(|proxy| proxy.as_str() != exclude)
                    .map(|proxy| keys::online_set(proxy))
                    .collect();
                let member = id.to_string();
                Box::pin(async move {
                    for key in &set_keys {
                        if conn.sismember(key, &member).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                })
            })
            .await
    }

    /// Whether any proxy in `roster` claims `id`.
    pub async fn is_online_anywhere(&self, roster: &[String], id: &Uuid) -> Result<bool> {
        self.online_elsewhere(roster, "", id).await
    }

    // ========================================================================
    // Presence records
    // ========================================================================

    pub async fn get_attribute(&self, id: &Uuid, field: PlayerField) -> Result<Option<String>> {
        self.ops
            .run(|conn| {
                let key = keys::player(&id.to_string());
                Box::pin(async move { conn.hget(&key, field.as_str()).await })
            })
            .await
    }

    pub async fn set_attribute(&self, id: &Uuid, field: PlayerField, value: &str) -> Result<()> {
        self.ops
            .run(|conn| {
                let key = keys::player(&id.to_string());
                let value = value.to_string();
                Box::pin(async move { conn.hset(&key, field.as_str(), &value).await })
            })
            .await
    }

    /// Connect write path: claim the player for `proxy_id` and mark it online.
    pub async fn record_connect(&self, proxy_id: &str, id: &Uuid, ip: IpAddr) -> Result<()> {
        self.ops
            .run(|conn| {
                let set_key = keys::online_set(proxy_id);
                let record_key = keys::player(&id.to_string());
                let member = id.to_string();
                let proxy = proxy_id.to_string();
                let ip = ip.to_string();
                Box::pin(async move {
                    conn.sadd(&set_key, &member).await?;
                    conn.hset(&record_key, PlayerField::Online.as_str(), "0").await?;
                    conn.hset(&record_key, PlayerField::Ip.as_str(), &ip).await?;
                    conn.hset(&record_key, PlayerField::Proxy.as_str(), &proxy).await
                })
            })
            .await?;
        debug!(%id, %proxy_id, "recorded connect");
        Ok(())
    }

    /// Disconnect write path: stamp the last-seen time and release the claim.
    pub async fn record_disconnect(&self, proxy_id: &str, id: &Uuid, timestamp: i64) -> Result<()> {
        self.ops
            .run(|conn| {
                let set_key = keys::online_set(proxy_id);
                let record_key = keys::player(&id.to_string());
                let member = id.to_string();
                let stamp = timestamp.to_string();
                Box::pin(async move {
                    conn.hset(&record_key, PlayerField::Online.as_str(), &stamp).await?;
                    conn.srem(&set_key, &member).await?;
                    conn.hdel(&record_key, &SESSION_FIELDS).await
                })
            })
            .await?;
        debug!(%id, %proxy_id, timestamp, "recorded disconnect");
        Ok(())
    }

    pub async fn record_server_change(&self, id: &Uuid, server: &str) -> Result<()> {
        self.set_attribute(id, PlayerField::Server, server).await
    }

    /// Remove a player's claim on `proxy_id` and its session fields. A record
    /// still marked online gets `timestamp` as its last-seen time; an existing
    /// last-seen time is kept.
    pub async fn clean_up_player(&self, proxy_id: &str, id: &Uuid, timestamp: i64) -> Result<()> {
        self.ops
            .run(|conn| {
                let set_key = keys::online_set(proxy_id);
                let record_key = keys::player(&id.to_string());
                let member = id.to_string();
                let stamp = timestamp.to_string();
                Box::pin(async move {
                    conn.srem(&set_key, &member).await?;
                    conn.hdel(&record_key, &SESSION_FIELDS).await?;
                    let online = conn.hget(&record_key, PlayerField::Online.as_str()).await?;
                    if online.as_deref() == Some("0") {
                        conn.hset(&record_key, PlayerField::Online.as_str(), &stamp).await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.ops
            .run(|conn| {
                let channel = channel.to_string();
                let message = message.to_string();
                Box::pin(async move { conn.publish(&channel, &message).await })
            })
            .await
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Persist both directions of a uuid <-> name mapping.
    pub async fn persist_identity(&self, id: &Uuid, name: &str) -> Result<()> {
        self.ops
            .run(|conn| {
                let member = id.to_string();
                let lower_name = name.to_lowercase();
                let name = name.to_string();
                Box::pin(async move {
                    conn.hset(keys::IDENTITY_BY_ID, &member, &name).await?;
                    conn.hset(keys::IDENTITY_BY_NAME, &lower_name, &member).await
                })
            })
            .await
    }

    pub async fn stored_name(&self, id: &Uuid) -> Result<Option<String>> {
        self.ops
            .run(|conn| {
                let member = id.to_string();
                Box::pin(async move { conn.hget(keys::IDENTITY_BY_ID, &member).await })
            })
            .await
    }

    /// Case-insensitive lookup of the uuid stored for `name`.
    pub async fn stored_id(&self, name: &str) -> Result<Option<Uuid>> {
        let raw = self
            .ops
            .run(|conn| {
                let lower_name = name.to_lowercase();
                Box::pin(async move { conn.hget(keys::IDENTITY_BY_NAME, &lower_name).await })
            })
            .await?;
        Ok(raw.and_then(|value| Uuid::parse_str(&value).ok()))
    }
}

fn parse_ids(members: HashSet<String>) -> HashSet<Uuid> {
    members
        .into_iter()
        .filter_map(|member| match Uuid::parse_str(&member) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(%member, "ignoring malformed player id in online set");
                None
            }
        })
        .collect()
}
