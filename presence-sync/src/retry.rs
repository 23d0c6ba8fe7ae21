//! Scoped store access with a single retry on connection failure.

use futures_util::future::BoxFuture;
use presence_store::{Backend, Connection, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::error;

use crate::error::{Result, SyncError};

/// Future returned by a store operation borrowing its connection for `'c`.
pub type StoreFuture<'c, T> = BoxFuture<'c, presence_store::Result<T>>;

/// Runs operations against a pooled connection, retrying once when the
/// connection itself fails.
pub struct ResilientOperation {
    backend: Arc<dyn Backend>,
    retry_delay: Duration,
}

impl ResilientOperation {
    pub fn new(backend: Arc<dyn Backend>, retry_delay: Duration) -> Self {
        Self {
            backend,
            retry_delay,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Acquire, run `op`, release.
    ///
    /// A connection failure (pool timeout included) discards the connection,
    /// waits `retry_delay` and repeats the acquire-execute sequence once. A
    /// second connection failure yields [`SyncError::StoreUnavailable`]. Other
    /// errors are returned as they are, without retrying.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut dyn Connection) -> StoreFuture<'c, T> + Send + Sync,
    {
        match self.attempt(&op).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_connection() => {
                error!(%err, "unable to use store connection, retrying once");
                sleep(self.retry_delay).await;
                match self.attempt(&op).await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_connection() => {
                        error!(%err, "store operation failed after retry");
                        Err(SyncError::StoreUnavailable(err))
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn attempt<T, F>(&self, op: &F) -> std::result::Result<T, StoreError>
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> StoreFuture<'c, T>,
    {
        let mut conn = self.backend.acquire().await?;
        let outcome = op(conn.as_mut()).await;
        match outcome {
            Err(err) if err.is_connection() => {
                conn.discard();
                Err(err)
            }
            // Dropping the connection hands it back to the pool.
            other => other,
        }
    }
}
