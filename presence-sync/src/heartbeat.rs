use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::presence::PresenceStore;

/// Publishes this proxy's heartbeat and keeps the roster of live proxies.
pub struct HeartbeatMonitor {
    proxy_id: String,
    store: Arc<PresenceStore>,
    roster: watch::Sender<Vec<String>>,
}

impl HeartbeatMonitor {
    pub fn new(proxy_id: impl Into<String>, store: Arc<PresenceStore>) -> Self {
        let (roster, _) = watch::channel(Vec::new());
        Self {
            proxy_id: proxy_id.into(),
            store,
            roster,
        }
    }

    /// Register our heartbeat, then refresh the roster from the store.
    pub async fn tick(&self) -> Result<Vec<String>> {
        self.store.register_heartbeat(&self.proxy_id).await?;
        let active = self.store.list_active_proxies().await?;

        let changed = self.roster.send_if_modified(|current| {
            if *current == active {
                return false;
            }
            current.clone_from(&active);
            true
        });
        if changed {
            info!(proxies = ?active, "proxy roster changed");
        } else {
            debug!(count = active.len(), "heartbeat sent");
        }
        Ok(active)
    }

    /// Scheduled form of [`tick`](Self::tick): a failure keeps the last roster.
    pub async fn run(&self) {
        if let Err(err) = self.tick().await {
            error!(%err, "heartbeat failed, keeping previous roster");
        }
    }

    pub fn roster(&self) -> Vec<String> {
        self.roster.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.roster.subscribe()
    }
}
