//! Lifecycle of one proxy instance and the engine's public surface.

use presence_store::{Backend, LastSeen};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::cache::PresenceCache;
use crate::config::Config;
use crate::directory::{CommandDispatch, ConnectionDirectory, IdentityLookup};
use crate::error::{Result, SyncError};
use crate::events::NetworkEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::helpers::now_millis;
use crate::identity::IdentityResolver;
use crate::message::{PresenceAction, PresenceEvent};
use crate::presence::PresenceStore;
use crate::reconcile::{ReconcileReport, ReconciliationJob};
use crate::retry::ResilientOperation;
use crate::scheduler::Scheduler;
use crate::validation::validate_proxy_id;
use crate::workers::WorkerPool;

/// A heartbeat for our own id younger than this means another live instance.
const IMPOSTOR_WINDOW_MS: i64 = 20_000;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unregistered,
    Active,
    Deregistered,
}

/// What the host proxy provides to the engine.
pub struct Collaborators {
    pub directory: Arc<dyn ConnectionDirectory>,
    pub dispatcher: Arc<dyn CommandDispatch>,
    pub lookup: Option<Arc<dyn IdentityLookup>>,
}

pub struct Instance {
    config: Config,
    state: Mutex<InstanceState>,
    store: Arc<PresenceStore>,
    cache: Arc<PresenceCache>,
    identity: Arc<IdentityResolver>,
    heartbeat: Arc<HeartbeatMonitor>,
    reconciler: Arc<ReconciliationJob>,
    bus: Arc<EventBus>,
    directory: Arc<dyn ConnectionDirectory>,
    scheduler: Scheduler,
    workers: WorkerPool,
    events: broadcast::Sender<NetworkEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    /// Register this proxy and start every background task.
    ///
    /// Fails without registering when the store is unreachable or another
    /// live instance already uses `config.proxy_id`.
    pub async fn start(
        config: Config,
        backend: Arc<dyn Backend>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        validate_proxy_id(&config.proxy_id)?;
        let proxy_id = config.proxy_id.clone();

        let ops = ResilientOperation::new(backend, config.retry_delay);
        ops.run(|conn| Box::pin(async move { conn.ping().await }))
            .await?;
        let store = Arc::new(PresenceStore::new(ops));

        check_impostor(&store, &config).await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let heartbeat = Arc::new(HeartbeatMonitor::new(&proxy_id, store.clone()));
        let roster = heartbeat.tick().await?;
        info!(%proxy_id, proxies = ?roster, "heartbeat registered");

        let lookup = collaborators.lookup.filter(|_| config.identity_lookup);
        let identity = Arc::new(IdentityResolver::new(store.clone(), lookup));
        let cache = Arc::new(PresenceCache::new(
            &proxy_id,
            collaborators.directory.clone(),
            store.clone(),
            events.clone(),
        ));
        let reconciler = Arc::new(ReconciliationJob::new(
            &proxy_id,
            store.clone(),
            collaborators.directory.clone(),
            heartbeat.subscribe(),
        ));
        let bus = Arc::new(EventBus::new(
            &proxy_id,
            store.clone(),
            cache.clone(),
            collaborators.dispatcher,
            events.clone(),
            heartbeat.subscribe(),
        ));
        let listener = match bus.start().await {
            Ok(listener) => listener,
            Err(err) => {
                // A fresh heartbeat would block the next start
                if let Err(cleanup) = store.remove_heartbeat(&proxy_id).await {
                    warn!(%proxy_id, err = %cleanup, "failed to remove heartbeat");
                }
                return Err(err);
            }
        };

        let scheduler = Scheduler::new();
        {
            let heartbeat = heartbeat.clone();
            scheduler.schedule(
                "heartbeat",
                config.heartbeat_interval,
                config.heartbeat_interval,
                move || {
                    let heartbeat = heartbeat.clone();
                    async move { heartbeat.run().await }
                },
            );
        }
        {
            let reconciler = reconciler.clone();
            scheduler.schedule(
                "reconcile",
                config.reconcile_interval,
                config.reconcile_interval,
                move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.run().await }
                },
            );
        }

        info!(
            %proxy_id,
            workers = config.worker_threads,
            heartbeat_secs = config.heartbeat_interval.as_secs(),
            reconcile_secs = config.reconcile_interval.as_secs(),
            "presence instance active"
        );

        Ok(Self {
            workers: WorkerPool::new(config.worker_threads),
            config,
            state: Mutex::new(InstanceState::Active),
            store,
            cache,
            identity,
            heartbeat,
            reconciler,
            bus,
            directory: collaborators.directory,
            scheduler,
            events,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.config.proxy_id
    }

    pub fn state(&self) -> InstanceState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(InstanceState::Deregistered)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &PresenceCache {
        &self.cache
    }

    // ========================================================================
    // Write paths
    // ========================================================================

    /// Record a local connect and announce it. Runs on the worker pool.
    pub fn player_connected(&self, id: Uuid, name: &str, ip: IpAddr) -> JoinHandle<Option<()>> {
        let proxy_id = self.config.proxy_id.clone();
        let name = name.to_string();
        let store = self.store.clone();
        let cache = self.cache.clone();
        let identity = self.identity.clone();
        let bus = self.bus.clone();

        self.workers.submit("connect", async move {
            cache.invalidate(&id).await;
            let result = async {
                store.record_connect(&proxy_id, &id, ip).await?;
                identity.persist(id, &name).await?;
                let event = PresenceEvent::new(id, proxy_id.as_str(), PresenceAction::Join { address: ip });
                bus.publish_event(&event).await
            }
            .await;
            if let Err(err) = result {
                error!(%id, %name, %err, "failed to record connect");
            }
        })
    }

    /// Record a local disconnect and announce it. Runs on the worker pool.
    pub fn player_disconnected(&self, id: Uuid) -> JoinHandle<Option<()>> {
        let proxy_id = self.config.proxy_id.clone();
        let timestamp = now_millis();
        let store = self.store.clone();
        let cache = self.cache.clone();
        let bus = self.bus.clone();

        self.workers.submit("disconnect", async move {
            cache.invalidate(&id).await;
            let result = async {
                store.record_disconnect(&proxy_id, &id, timestamp).await?;
                let event = PresenceEvent::new(id, proxy_id.as_str(), PresenceAction::Leave { timestamp });
                bus.publish_event(&event).await
            }
            .await;
            if let Err(err) = result {
                error!(%id, %err, "failed to record disconnect");
            }
        })
    }

    /// Record a backend switch of a local player and announce it.
    pub fn player_changed_server(&self, id: Uuid, server: &str) -> JoinHandle<Option<()>> {
        let proxy_id = self.config.proxy_id.clone();
        let server = server.to_string();
        let store = self.store.clone();
        let bus = self.bus.clone();

        self.workers.submit("server-change", async move {
            let result = async {
                store.record_server_change(&id, &server).await?;
                let action = PresenceAction::ServerChange {
                    server: server.clone(),
                };
                bus.publish_event(&PresenceEvent::new(id, proxy_id.as_str(), action)).await
            }
            .await;
            if let Err(err) = result {
                error!(%id, %server, %err, "failed to record server change");
            }
        })
    }

    /// Duplicate-login check: whether any live proxy, this one included,
    /// already claims `id`.
    pub async fn is_online_anywhere(&self, id: &Uuid) -> Result<bool> {
        self.store
            .is_online_anywhere(&self.heartbeat.roster(), id)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn server_of(&self, id: &Uuid) -> Result<Option<String>> {
        self.cache.server_of(id).await
    }

    pub async fn proxy_of(&self, id: &Uuid) -> Result<Option<String>> {
        self.cache.proxy_of(id).await
    }

    pub async fn ip_of(&self, id: &Uuid) -> Result<Option<IpAddr>> {
        self.cache.ip_of(id).await
    }

    pub async fn last_seen_of(&self, id: &Uuid) -> Result<LastSeen> {
        self.cache.last_seen_of(id).await
    }

    /// Sum of the online set sizes of all live proxies.
    pub async fn count_online(&self) -> Result<usize> {
        self.store.count_online(&self.heartbeat.roster()).await
    }

    /// Local connections plus every id claimed by another live proxy.
    pub async fn all_online_ids(&self) -> Result<HashSet<Uuid>> {
        let mut ids = self
            .store
            .union_online_players(&self.heartbeat.roster(), self.proxy_id())
            .await?;
        ids.extend(self.directory.local_ids());
        Ok(ids)
    }

    pub fn active_proxy_ids(&self) -> Vec<String> {
        self.heartbeat.roster()
    }

    /// Online players grouped by backend server. Players whose server is not
    /// known yet are left out.
    pub async fn players_by_server(&self) -> Result<BTreeMap<String, Vec<Uuid>>> {
        let mut servers: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for id in self.all_online_ids().await? {
            if let Some(server) = self.cache.server_of(&id).await? {
                servers.entry(server).or_default().push(id);
            }
        }
        for players in servers.values_mut() {
            players.sort();
        }
        Ok(servers)
    }

    pub async fn name_of(&self, id: &Uuid, allow_expensive: bool) -> Result<Option<String>> {
        self.identity.resolve_name(id, allow_expensive).await
    }

    pub async fn id_of(&self, name: &str, allow_expensive: bool) -> Result<Option<Uuid>> {
        self.identity.resolve_id(name, allow_expensive).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run a reconciliation pass now instead of waiting for the schedule.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile().await
    }

    /// Send a heartbeat and refresh the roster now.
    pub async fn heartbeat_now(&self) -> Result<Vec<String>> {
        self.heartbeat.tick().await
    }

    /// Deregister: stop listening and scheduling, drain pending writes, remove
    /// the heartbeat and release every player still claimed by this proxy.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let Ok(mut state) = self.state.lock() else {
                return Ok(());
            };
            if *state != InstanceState::Active {
                return Ok(());
            }
            *state = InstanceState::Deregistered;
        }
        let proxy_id = self.proxy_id();
        info!(%proxy_id, "shutting down presence instance");

        self.bus.poison();
        let listener = self.listener.lock().ok().and_then(|mut handle| handle.take());
        if let Some(listener) = listener {
            if let Err(err) = listener.await {
                warn!(%err, "event bus listener ended abnormally");
            }
        }
        self.scheduler.cancel_all().await;

        info!("waiting for pending writes to finish");
        self.workers.drain(self.config.shutdown_grace).await;

        self.store.remove_heartbeat(proxy_id).await?;
        let survivors = self.store.online_set(proxy_id).await?;
        if !survivors.is_empty() {
            info!(count = survivors.len(), "releasing players still claimed by this proxy");
        }
        let timestamp = now_millis();
        for id in survivors {
            if let Err(err) = self.store.clean_up_player(proxy_id, &id, timestamp).await {
                error!(%id, %err, "failed to release player");
                continue;
            }
            let event = PresenceEvent::new(id, proxy_id, PresenceAction::Leave { timestamp });
            if let Err(err) = self.bus.publish_event(&event).await {
                warn!(%id, %err, "failed to announce release");
            }
        }

        info!(%proxy_id, "presence instance deregistered");
        Ok(())
    }
}

/// Refuse to start while another instance heartbeats under our id, unless
/// the operator left a crash marker (consumed here).
async fn check_impostor(store: &PresenceStore, config: &Config) -> Result<()> {
    match tokio::fs::remove_file(&config.crash_marker).await {
        Ok(()) => {
            info!(
                marker = %config.crash_marker.display(),
                "crash marker found, skipping impostor check"
            );
            return Ok(());
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(SyncError::Io(err)),
    }

    if let Some(last) = store.heartbeat_of(&config.proxy_id).await? {
        let age_ms = now_millis() - last;
        if age_ms < IMPOSTOR_WINDOW_MS {
            error!(
                proxy_id = %config.proxy_id,
                age_ms,
                "another instance is heartbeating under this id"
            );
            return Err(SyncError::Impostor {
                proxy_id: config.proxy_id.clone(),
                age_ms,
            });
        }
    }
    Ok(())
}
