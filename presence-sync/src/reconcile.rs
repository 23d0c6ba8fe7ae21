use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::directory::ConnectionDirectory;
use crate::error::Result;
use crate::helpers::now_millis;
use crate::presence::PresenceStore;

/// Corrections made by one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids in our set that another live proxy also claims; dropped from ours.
    pub stale_duplicates: usize,
    /// Ids no live proxy has; fully cleaned up.
    pub orphans: usize,
    /// Locally connected ids missing from our set; re-added.
    pub restored: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Repairs drift between this proxy's connections and its stored online set.
/// Only stored metadata is touched; live sessions are never disconnected.
pub struct ReconciliationJob {
    proxy_id: String,
    store: Arc<PresenceStore>,
    directory: Arc<dyn ConnectionDirectory>,
    roster: watch::Receiver<Vec<String>>,
}

impl ReconciliationJob {
    pub fn new(
        proxy_id: impl Into<String>,
        store: Arc<PresenceStore>,
        directory: Arc<dyn ConnectionDirectory>,
        roster: watch::Receiver<Vec<String>>,
    ) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            store,
            directory,
            roster,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let proxy_id = self.proxy_id.as_str();
        let local = self.directory.local_ids();
        let stored = self.store.online_set(proxy_id).await?;
        let roster = self.roster.borrow().clone();
        let mut report = ReconcileReport::default();

        for id in stored.difference(&local) {
            if self.store.online_elsewhere(&roster, proxy_id, id).await? {
                self.store.remove_from_online_set(proxy_id, id).await?;
                warn!(%id, "player in our set is not connected here but is on another proxy, removed from set");
                report.stale_duplicates += 1;
            } else {
                self.store.clean_up_player(proxy_id, id, now_millis()).await?;
                warn!(%id, "player in our set is not connected anywhere, cleaned up");
                report.orphans += 1;
            }
        }

        for id in local.difference(&stored) {
            self.store.add_to_online_set(proxy_id, id).await?;
            warn!(%id, "player is connected here but missing from our set, re-added");
            report.restored += 1;
        }

        Ok(report)
    }

    /// Scheduled form of [`reconcile`](Self::reconcile).
    pub async fn run(&self) {
        match self.reconcile().await {
            Ok(report) if report.is_clean() => debug!("presence reconciled, no drift"),
            Ok(report) => warn!(?report, "presence drift corrected"),
            Err(err) => error!(%err, "reconciliation failed"),
        }
    }
}
