mod error;
pub mod keys;
mod memory;
mod models;
mod redis_pool;

pub use error::{Result, StoreError};
pub use memory::MemoryBackend;
pub use models::{ChannelMessage, LastSeen, PlayerField, PlayerName};
pub use redis_pool::RedisBackend;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Stream of messages for the channels a subscription was opened with.
/// Dropping the stream closes the subscription.
pub type Subscription = BoxStream<'static, ChannelMessage>;

/// A pooled store offering hashes, sets and publish/subscribe.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Take a connection from the pool, waiting at most the pool timeout.
  async fn acquire(&self) -> Result<Box<dyn Connection>>;

  /// Open a dedicated subscription on `channels`.
  async fn subscribe(&self, channels: Vec<String>) -> Result<Subscription>;
}

/// One live store connection. Dropping it returns it to the pool.
#[async_trait]
pub trait Connection: Send {
  async fn ping(&mut self) -> Result<()>;

  async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()>;
  async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>>;
  async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>>;
  async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<()>;

  async fn sadd(&mut self, key: &str, member: &str) -> Result<()>;
  async fn srem(&mut self, key: &str, member: &str) -> Result<()>;
  async fn smembers(&mut self, key: &str) -> Result<HashSet<String>>;
  async fn sismember(&mut self, key: &str, member: &str) -> Result<bool>;
  async fn scard(&mut self, key: &str) -> Result<usize>;
  async fn sunion(&mut self, keys: &[String]) -> Result<HashSet<String>>;

  async fn publish(&mut self, channel: &str, message: &str) -> Result<()>;

  /// Drop this connection without handing it back to the pool.
  fn discard(self: Box<Self>);
}

/// Open a backend from a url: `memory://` or `redis://host:port/db`.
pub fn open(url: &str, pool_size: usize, wait_timeout: Duration) -> Result<Arc<dyn Backend>> {
  if url.starts_with("memory://") {
    info!(pool_size, "using in-memory store");
    return Ok(Arc::new(MemoryBackend::with_pool(pool_size, wait_timeout)));
  }

  if url.starts_with("redis://") || url.starts_with("rediss://") {
    let backend = RedisBackend::connect(url, pool_size, wait_timeout)?;
    info!(pool_size, "using redis store");
    return Ok(Arc::new(backend));
  }

  Err(StoreError::UnsupportedUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_open_memory_backend() {
    let backend = open("memory://", 4, Duration::from_millis(50)).unwrap();
    let mut conn = backend.acquire().await.unwrap();
    conn.ping().await.unwrap();
  }

  #[tokio::test]
  async fn test_open_rejects_unknown_scheme() {
    let result = open("postgres://localhost", 4, Duration::from_millis(50));
    assert!(matches!(result, Err(StoreError::UnsupportedUrl(_))));
  }
}
