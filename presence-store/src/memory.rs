//! In-process store backend.
//!
//! Keeps hashes and sets in a lock-free `scc::HashMap` and fans published
//! messages out over a `tokio::sync::broadcast` channel. Several instances
//! sharing one `MemoryBackend` behave like proxies sharing one store, which is
//! what the integration tests and single-node deployments rely on.

use crate::{Backend, ChannelMessage, Connection, Result, StoreError, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::ready;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 1024;

/// A value stored under one key.
#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

struct State {
    data: scc::HashMap<String, Value>,
    events: broadcast::Sender<ChannelMessage>,
    pending_failures: AtomicUsize,
    failing_keys: scc::HashMap<String, ()>,
    reject_subscriptions: AtomicBool,
    commands: AtomicUsize,
    discarded: AtomicUsize,
}

/// Store backend held entirely in memory.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<State>,
    permits: Arc<Semaphore>,
    wait_timeout: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_pool(DEFAULT_POOL_SIZE, DEFAULT_WAIT_TIMEOUT)
    }

    /// Create a backend whose pool hands out at most `pool_size` connections.
    pub fn with_pool(pool_size: usize, wait_timeout: Duration) -> Self {
        let (events, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(State {
                data: scc::HashMap::new(),
                events,
                pending_failures: AtomicUsize::new(0),
                failing_keys: scc::HashMap::new(),
                reject_subscriptions: AtomicBool::new(false),
                commands: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            wait_timeout,
        }
    }

    /// Make the next `count` commands fail with a connection error.
    pub fn fail_next(&self, count: usize) {
        self.state.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Make every command on `key` fail with a connection error from now on.
    pub async fn fail_key(&self, key: &str) {
        let _ = self.state.failing_keys.insert_async(key.to_string(), ()).await;
    }

    /// While set, opening a subscription fails with a connection error.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.state.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Total commands issued against this backend, failed ones included.
    pub fn commands_issued(&self) -> usize {
        self.state.commands.load(Ordering::SeqCst)
    }

    /// Connections dropped as broken instead of returned to the pool.
    pub fn discarded_connections(&self) -> usize {
        self.state.discarded.load(Ordering::SeqCst)
    }

    /// Connections currently available in the pool.
    pub fn idle_connections(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let permit = match tokio::time::timeout(
            self.wait_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::Connection("pool closed".to_string())),
            Err(_) => return Err(StoreError::PoolTimeout),
        };

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            _permit: permit,
        }))
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<Subscription> {
        if self.state.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("subscriptions rejected".to_string()));
        }
        let channels: HashSet<String> = channels.into_iter().collect();
        let stream = BroadcastStream::new(self.state.events.subscribe()).filter_map(move |item| {
            let delivered = match item {
                Ok(message) if channels.contains(&message.channel) => Some(message),
                Ok(_) => None,
                Err(err) => {
                    warn!(%err, "subscriber lagged behind, messages dropped");
                    None
                }
            };
            ready(delivered)
        });
        Ok(Box::pin(stream))
    }
}

struct MemoryConnection {
    state: Arc<State>,
    _permit: OwnedSemaphorePermit,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

impl MemoryConnection {
    /// Count the command and consume one injected failure if any are pending.
    fn begin(&self) -> Result<()> {
        self.state.commands.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .state
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Connection(
                "injected connection failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn begin_on(&self, key: &str) -> Result<()> {
        self.begin()?;
        if self.state.failing_keys.read_async(key, |_, _| ()).await.is_some() {
            return Err(StoreError::Connection(format!(
                "injected connection failure on '{key}'"
            )));
        }
        Ok(())
    }

    async fn with_hash<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, String>) -> R,
    ) -> Result<R> {
        let mut entry = self
            .state
            .data
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry.get_mut() {
            Value::Hash(hash) => Ok(f(hash)),
            Value::Set(_) => Err(wrong_type(key)),
        }
    }

    async fn with_set<R>(&self, key: &str, f: impl FnOnce(&mut HashSet<String>) -> R) -> Result<R> {
        let mut entry = self
            .state
            .data
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| Value::Set(HashSet::new()));
        match entry.get_mut() {
            Value::Set(set) => Ok(f(set)),
            Value::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn read_hash<R>(
        &self,
        key: &str,
        f: impl FnOnce(&HashMap<String, String>) -> R,
        missing: R,
    ) -> Result<R> {
        self.state
            .data
            .read_async(key, |_, value| match value {
                Value::Hash(hash) => Ok(f(hash)),
                Value::Set(_) => Err(wrong_type(key)),
            })
            .await
            .unwrap_or(Ok(missing))
    }

    async fn read_set<R>(
        &self,
        key: &str,
        f: impl FnOnce(&HashSet<String>) -> R,
        missing: R,
    ) -> Result<R> {
        self.state
            .data
            .read_async(key, |_, value| match value {
                Value::Set(set) => Ok(f(set)),
                Value::Hash(_) => Err(wrong_type(key)),
            })
            .await
            .unwrap_or(Ok(missing))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.begin()
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        self.begin_on(key).await?;
        self.with_hash(key, |hash| {
            hash.insert(field.to_string(), value.to_string());
        })
        .await
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.begin_on(key).await?;
        self.read_hash(key, |hash| hash.get(field).cloned(), None).await
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.begin_on(key).await?;
        self.read_hash(key, |hash| hash.clone(), HashMap::new()).await
    }

    async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<()> {
        self.begin_on(key).await?;
        self.with_hash(key, |hash| {
            for field in fields {
                hash.remove(*field);
            }
        })
        .await
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<()> {
        self.begin_on(key).await?;
        self.with_set(key, |set| {
            set.insert(member.to_string());
        })
        .await
    }

    async fn srem(&mut self, key: &str, member: &str) -> Result<()> {
        self.begin_on(key).await?;
        self.with_set(key, |set| {
            set.remove(member);
        })
        .await
    }

    async fn smembers(&mut self, key: &str) -> Result<HashSet<String>> {
        self.begin_on(key).await?;
        self.read_set(key, |set| set.clone(), HashSet::new()).await
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        self.begin_on(key).await?;
        self.read_set(key, |set| set.contains(member), false).await
    }

    async fn scard(&mut self, key: &str) -> Result<usize> {
        self.begin_on(key).await?;
        self.read_set(key, |set| set.len(), 0).await
    }

    async fn sunion(&mut self, keys: &[String]) -> Result<HashSet<String>> {
        self.begin()?;
        let mut union = HashSet::new();
        for key in keys {
            let members = self.read_set(key, |set| set.clone(), HashSet::new()).await?;
            union.extend(members);
        }
        Ok(union)
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<()> {
        self.begin()?;
        // No subscribers is not an error for pub/sub.
        let _ = self
            .state
            .events
            .send(ChannelMessage::new(channel, message));
        Ok(())
    }

    fn discard(self: Box<Self>) {
        self.state.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_and_set_commands() {
        let backend = MemoryBackend::new();
        let mut conn = backend.acquire().await.unwrap();

        conn.hset("player:1", "server", "lobby").await.unwrap();
        conn.hset("player:1", "proxy", "p1").await.unwrap();
        assert_eq!(
            conn.hget("player:1", "server").await.unwrap().as_deref(),
            Some("lobby")
        );
        conn.hdel("player:1", &["server"]).await.unwrap();
        assert_eq!(conn.hget("player:1", "server").await.unwrap(), None);
        assert_eq!(conn.hgetall("player:1").await.unwrap().len(), 1);

        conn.sadd("proxy:a:usersOnline", "1").await.unwrap();
        conn.sadd("proxy:a:usersOnline", "2").await.unwrap();
        conn.sadd("proxy:b:usersOnline", "2").await.unwrap();
        conn.sadd("proxy:b:usersOnline", "3").await.unwrap();
        assert_eq!(conn.scard("proxy:a:usersOnline").await.unwrap(), 2);
        assert!(conn.sismember("proxy:b:usersOnline", "3").await.unwrap());

        let union = conn
            .sunion(&["proxy:a:usersOnline".to_string(), "proxy:b:usersOnline".to_string()])
            .await
            .unwrap();
        assert_eq!(union.len(), 3);

        conn.srem("proxy:a:usersOnline", "1").await.unwrap();
        assert_eq!(conn.smembers("proxy:a:usersOnline").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_command_error() {
        let backend = MemoryBackend::new();
        let mut conn = backend.acquire().await.unwrap();

        conn.sadd("key", "member").await.unwrap();
        let err = conn.hget("key", "field").await.unwrap_err();
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn test_missing_keys_read_as_empty() {
        let backend = MemoryBackend::new();
        let mut conn = backend.acquire().await.unwrap();

        assert_eq!(conn.hget("nothing", "field").await.unwrap(), None);
        assert!(conn.smembers("nothing").await.unwrap().is_empty());
        assert_eq!(conn.scard("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let backend = MemoryBackend::with_pool(1, Duration::from_millis(20));
        let _held = backend.acquire().await.unwrap();

        let result = backend.acquire().await;
        assert!(matches!(result, Err(StoreError::PoolTimeout)));
    }

    #[tokio::test]
    async fn test_released_connection_returns_to_pool() {
        let backend = MemoryBackend::with_pool(2, Duration::from_millis(20));
        {
            let _conn = backend.acquire().await.unwrap();
            assert_eq!(backend.idle_connections(), 1);
        }
        assert_eq!(backend.idle_connections(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_connection_errors() {
        let backend = MemoryBackend::new();
        backend.fail_next(1);
        let mut conn = backend.acquire().await.unwrap();

        assert!(conn.ping().await.unwrap_err().is_connection());
        assert!(conn.ping().await.is_ok());
        assert_eq!(backend.commands_issued(), 2);

        conn.discard();
        assert_eq!(backend.discarded_connections(), 1);
    }

    #[tokio::test]
    async fn test_failing_key_only_affects_that_key() {
        let backend = MemoryBackend::new();
        backend.fail_key("player:1").await;
        let mut conn = backend.acquire().await.unwrap();

        assert!(conn.hget("player:1", "server").await.unwrap_err().is_connection());
        assert!(conn.hset("player:2", "server", "lobby").await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_filters_channels() {
        let backend = MemoryBackend::new();
        let mut sub = backend
            .subscribe(vec!["presence-data".to_string()])
            .await
            .unwrap();

        let mut conn = backend.acquire().await.unwrap();
        conn.publish("elsewhere", "ignored").await.unwrap();
        conn.publish("presence-data", "hello").await.unwrap();

        let message = sub.next().await.unwrap();
        assert_eq!(message, ChannelMessage::new("presence-data", "hello"));
    }
}
