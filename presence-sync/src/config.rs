use std::env::var;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::helpers::generate_proxy_id;

/// Engine configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this proxy instance
    /// Env: PROXY_ID (required unless RANDOM_PROXY_ID=true)
    pub proxy_id: String,

    /// Store location, `redis://host:port/db` or `memory://`
    /// Env: STORE_URL (default: "redis://127.0.0.1:6379")
    pub store_url: String,

    /// Maximum pooled store connections
    /// Env: POOL_SIZE (default: 8)
    pub pool_size: usize,

    /// How long a caller waits for a pooled connection before failing
    /// Env: POOL_TIMEOUT_MS (default: 2000)
    pub pool_timeout: Duration,

    /// Pause before the single retry of a failed store operation
    /// Env: RETRY_DELAY_MS (default: 100)
    pub retry_delay: Duration,

    /// Heartbeat and roster refresh period
    /// Env: HEARTBEAT_INTERVAL_SECS (default: 3)
    pub heartbeat_interval: Duration,

    /// Drift reconciliation period
    /// Env: RECONCILE_INTERVAL_SECS (default: 60)
    pub reconcile_interval: Duration,

    /// Size of the worker pool running connect/disconnect/server-change writes
    /// Env: WORKER_THREADS (default: 16)
    pub worker_threads: usize,

    /// How long shutdown waits for in-flight writes before cancelling them
    /// Env: SHUTDOWN_GRACE_SECS (default: 60)
    pub shutdown_grace: Duration,

    /// Presence of this file disables the impostor check once (it is deleted)
    /// Env: CRASH_MARKER_PATH (default: "restarted_from_crash.txt")
    pub crash_marker: PathBuf,

    /// Whether the external identity lookup may be consulted
    /// Env: IDENTITY_LOOKUP (default: false)
    pub identity_lookup: bool,

    /// Status API port
    /// Env: STATUS_PORT (default: 3000)
    pub status_port: u16,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 65536)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for local runs mostly
        let defaults = Self::default();
        let proxy_id = if env_or_default("RANDOM_PROXY_ID", false) {
            generate_proxy_id()
        } else {
            env_or_default_string("PROXY_ID", "")
        };
        Self {
            proxy_id,
            store_url: env_or_default_string("STORE_URL", &defaults.store_url),
            pool_size: env_or_default("POOL_SIZE", defaults.pool_size),
            pool_timeout: Duration::from_millis(env_or_default("POOL_TIMEOUT_MS", 2000)),
            retry_delay: Duration::from_millis(env_or_default("RETRY_DELAY_MS", 100)),
            heartbeat_interval: Duration::from_secs(env_or_default("HEARTBEAT_INTERVAL_SECS", 3)),
            reconcile_interval: Duration::from_secs(env_or_default("RECONCILE_INTERVAL_SECS", 60)),
            worker_threads: env_or_default("WORKER_THREADS", defaults.worker_threads),
            shutdown_grace: Duration::from_secs(env_or_default("SHUTDOWN_GRACE_SECS", 60)),
            crash_marker: PathBuf::from(env_or_default_string(
                "CRASH_MARKER_PATH",
                "restarted_from_crash.txt",
            )),
            identity_lookup: env_or_default("IDENTITY_LOOKUP", false),
            status_port: env_or_default("STATUS_PORT", defaults.status_port),
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", defaults.request_body_limit),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 30)),
        }
    }

    /// Configuration for a given proxy id with all other values defaulted
    pub fn for_proxy(proxy_id: impl Into<String>) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_id: String::new(),
            store_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 8,
            pool_timeout: Duration::from_millis(2000),
            retry_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(60),
            worker_threads: 16,
            shutdown_grace: Duration::from_secs(60),
            crash_marker: PathBuf::from("restarted_from_crash.txt"),
            identity_lookup: false,
            status_port: 3000,
            request_body_limit: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}
