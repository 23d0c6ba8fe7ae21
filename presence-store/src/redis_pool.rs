//! Redis backend: pooled command connections plus dedicated pub/sub connections.

use crate::{Backend, ChannelMessage, Connection, Result, StoreError, Subscription};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures_util::StreamExt;
use futures_util::future::ready;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

pub struct RedisBackend {
    client: redis::Client,
    pool: Pool,
}

impl RedisBackend {
    /// Build the pool. Connections are created lazily on first use.
    pub fn connect(url: &str, pool_size: usize, wait_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;

        let mut pool_config = PoolConfig::new(pool_size.max(1));
        pool_config.timeouts.wait = Some(wait_timeout);
        pool_config.timeouts.create = Some(wait_timeout);
        pool_config.timeouts.recycle = Some(wait_timeout);

        let mut config = Config::from_url(url);
        config.pool = Some(pool_config);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { client, pool })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let conn = self.pool.get().await?;
        Ok(Box::new(PooledConnection(conn)))
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(?channels, "subscribed");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let delivered = match msg.get_payload::<String>() {
                Ok(payload) => Some(ChannelMessage { channel, payload }),
                Err(err) => {
                    warn!(%channel, %err, "dropping non-utf8 message");
                    None
                }
            };
            ready(delivered)
        });
        Ok(Box::pin(stream))
    }
}

struct PooledConnection(deadpool_redis::Connection);

#[async_trait]
impl Connection for PooledConnection {
    async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.0).await?;
        Ok(())
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.0.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.0.hget(key, field).await?)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.0.hgetall(key).await?)
    }

    async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<()> {
        let _: () = self.0.hdel(key, fields).await?;
        Ok(())
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<()> {
        let _: () = self.0.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&mut self, key: &str, member: &str) -> Result<()> {
        let _: () = self.0.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&mut self, key: &str) -> Result<HashSet<String>> {
        Ok(self.0.smembers(key).await?)
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(self.0.sismember(key, member).await?)
    }

    async fn scard(&mut self, key: &str) -> Result<usize> {
        Ok(self.0.scard(key).await?)
    }

    async fn sunion(&mut self, keys: &[String]) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        Ok(self.0.sunion(keys).await?)
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<()> {
        let _: () = self.0.publish(channel, message).await?;
        Ok(())
    }

    fn discard(self: Box<Self>) {
        // Detach from the pool so the broken socket is never recycled.
        let _ = deadpool_redis::Connection::take(self.0);
    }
}
