use presence_store::PlayerName;
use scc::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::IdentityLookup;
use crate::error::Result;
use crate::presence::PresenceStore;
use crate::validation::validate_player_name;

/// Resolves uuid <-> name through the local cache, the store and, when
/// allowed, an external lookup service. Names match case-insensitively.
pub struct IdentityResolver {
    by_id: HashMap<Uuid, PlayerName>,
    by_name: HashMap<String, Uuid>,
    store: Arc<PresenceStore>,
    lookup: Option<Arc<dyn IdentityLookup>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<PresenceStore>, lookup: Option<Arc<dyn IdentityLookup>>) -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            store,
            lookup,
        }
    }

    /// Record a mapping locally and in the store.
    pub async fn persist(&self, id: Uuid, name: &str) -> Result<()> {
        self.remember(id, name).await;
        self.store.persist_identity(&id, name).await
    }

    pub async fn resolve_name(&self, id: &Uuid, allow_expensive: bool) -> Result<Option<String>> {
        if let Some(name) = self.by_id.read_async(id, |_, name| name.to_string()).await {
            return Ok(Some(name));
        }

        if let Some(name) = self.store.stored_name(id).await? {
            self.remember(*id, &name).await;
            return Ok(Some(name));
        }

        if !allow_expensive {
            return Ok(None);
        }
        let Some(lookup) = &self.lookup else {
            return Ok(None);
        };
        match lookup.name_for(id).await {
            Ok(Some(name)) => {
                self.persist(*id, &name).await?;
                Ok(Some(name))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(%id, error = %err, "identity lookup failed");
                Ok(None)
            }
        }
    }

    pub async fn resolve_id(&self, name: &str, allow_expensive: bool) -> Result<Option<Uuid>> {
        // No account can carry such a name
        if let Err(err) = validate_player_name(name) {
            debug!(%name, %err, "not resolving invalid name");
            return Ok(None);
        }
        let key = name.to_lowercase();
        if let Some(id) = self.by_name.read_async(&key, |_, id| *id).await {
            return Ok(Some(id));
        }

        if let Some(id) = self.store.stored_id(name).await? {
            // The caller's casing may differ from the stored one
            match self.store.stored_name(&id).await? {
                Some(canonical) => self.remember(id, &canonical).await,
                None => self.remember_name(key, id).await,
            }
            return Ok(Some(id));
        }

        if !allow_expensive {
            return Ok(None);
        }
        let Some(lookup) = &self.lookup else {
            return Ok(None);
        };
        match lookup.id_for(name).await {
            Ok(Some((id, canonical))) => {
                self.persist(id, &canonical).await?;
                Ok(Some(id))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(%name, error = %err, "identity lookup failed");
                Ok(None)
            }
        }
    }

    async fn remember(&self, id: Uuid, name: &str) {
        let Ok(inline) = PlayerName::try_from(name) else {
            debug!(%id, %name, "name too long to cache");
            return;
        };
        self.by_id
            .entry_async(id)
            .await
            .and_modify(|cached| *cached = inline)
            .or_insert(inline);
        self.remember_name(name.to_lowercase(), id).await;
    }

    async fn remember_name(&self, key: String, id: Uuid) {
        self.by_name
            .entry_async(key)
            .await
            .and_modify(|cached| *cached = id)
            .or_insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ResilientOperation;
    use async_trait::async_trait;
    use presence_store::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLookup {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IdentityLookup for CountingLookup {
        async fn name_for(&self, _id: &Uuid) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("lookup service down");
            }
            Ok(Some("Notch".to_string()))
        }

        async fn id_for(&self, name: &str) -> anyhow::Result<Option<(Uuid, String)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("lookup service down");
            }
            Ok((name.eq_ignore_ascii_case("jeb_")).then(|| (JEB, "jeb_".to_string())))
        }
    }

    const JEB: Uuid = Uuid::from_u128(0x853c80ef_3c37_49fd_aa49_938b674adae6);

    fn store() -> Arc<PresenceStore> {
        let ops = ResilientOperation::new(Arc::new(MemoryBackend::new()), Duration::from_millis(1));
        Arc::new(PresenceStore::new(ops))
    }

    #[tokio::test]
    async fn test_names_resolve_case_insensitively() {
        let resolver = IdentityResolver::new(store(), None);
        let id = Uuid::new_v4();
        resolver.persist(id, "Steve").await.unwrap();

        assert_eq!(resolver.resolve_id("sTeVe", false).await.unwrap(), Some(id));
        assert_eq!(resolver.resolve_name(&id, false).await.unwrap().as_deref(), Some("Steve"));
    }

    #[tokio::test]
    async fn test_store_hit_populates_local_cache() {
        let store = store();
        let id = Uuid::new_v4();
        store.persist_identity(&id, "Alex").await.unwrap();
        let resolver = IdentityResolver::new(store, None);

        assert_eq!(resolver.resolve_id("alex", false).await.unwrap(), Some(id));
        assert!(resolver.by_id.read_async(&id, |_, _| ()).await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_only_when_allowed() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let resolver = IdentityResolver::new(store(), Some(lookup.clone()));
        let id = Uuid::new_v4();

        assert_eq!(resolver.resolve_name(&id, false).await.unwrap(), None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);

        assert_eq!(resolver.resolve_name(&id, true).await.unwrap().as_deref(), Some("Notch"));
        // Persisted, so the next resolve stays local
        assert_eq!(resolver.resolve_id("notch", true).await.unwrap(), Some(id));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_hit_keeps_canonical_casing() {
        let store = store();
        let id = Uuid::new_v4();
        store.persist_identity(&id, "Steve").await.unwrap();
        let resolver = IdentityResolver::new(store, None);

        assert_eq!(resolver.resolve_id("STEVE", false).await.unwrap(), Some(id));
        assert_eq!(resolver.resolve_name(&id, false).await.unwrap().as_deref(), Some("Steve"));
    }

    #[tokio::test]
    async fn test_lookup_persists_canonical_casing() {
        let store = store();
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let resolver = IdentityResolver::new(store.clone(), Some(lookup));

        assert_eq!(resolver.resolve_id("JEB_", true).await.unwrap(), Some(JEB));
        assert_eq!(resolver.resolve_name(&JEB, false).await.unwrap().as_deref(), Some("jeb_"));
        assert_eq!(store.stored_name(&JEB).await.unwrap().as_deref(), Some("jeb_"));
    }

    #[tokio::test]
    async fn test_invalid_names_never_reach_lookup() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let resolver = IdentityResolver::new(store(), Some(lookup.clone()));

        assert_eq!(resolver.resolve_id("not a name", true).await.unwrap(), None);
        assert_eq!(resolver.resolve_id("", true).await.unwrap(), None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_degrades_to_not_found() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let resolver = IdentityResolver::new(store(), Some(lookup));

        assert_eq!(resolver.resolve_name(&Uuid::new_v4(), true).await.unwrap(), None);
    }
}
