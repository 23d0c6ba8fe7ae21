use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("timed out waiting for a pooled store connection")]
    PoolTimeout,

    #[error("store command failed: {0}")]
    Command(String),

    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),
}

impl StoreError {
    /// Transient failures the retry wrapper is allowed to retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::PoolTimeout)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Timeout(_) => StoreError::PoolTimeout,
            deadpool_redis::PoolError::Backend(e) => e.into(),
            other => StoreError::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
