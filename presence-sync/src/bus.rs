//! Pub/sub plumbing: one long-lived listener plus the publish side.

use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, future::ready};
use presence_store::{Backend, ChannelMessage, Subscription, keys};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::PresenceCache;
use crate::directory::CommandDispatch;
use crate::error::{Result, SyncError};
use crate::events::NetworkEvent;
use crate::message::PresenceEvent;
use crate::presence::PresenceStore;
use crate::validation::{normalize_command, validate_channel};

const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// A custom channel's messages, ending with `None` once the store closes it.
type ChannelStream = BoxStream<'static, Option<ChannelMessage>>;

enum ChannelChange {
    Add(String, ChannelStream),
    Remove(String),
}

pub struct EventBus {
    proxy_id: String,
    addressed: String,
    store: Arc<PresenceStore>,
    backend: Arc<dyn Backend>,
    /// Custom channels. Held while a subscription is opened so changes
    /// reach the listener in order.
    custom: Mutex<BTreeSet<String>>,
    changes: mpsc::UnboundedSender<ChannelChange>,
    pending_changes: StdMutex<Option<mpsc::UnboundedReceiver<ChannelChange>>>,
    poison: CancellationToken,
    cache: Arc<PresenceCache>,
    dispatcher: Arc<dyn CommandDispatch>,
    events: broadcast::Sender<NetworkEvent>,
    roster: watch::Receiver<Vec<String>>,
}

impl EventBus {
    pub fn new(
        proxy_id: impl Into<String>,
        store: Arc<PresenceStore>,
        cache: Arc<PresenceCache>,
        dispatcher: Arc<dyn CommandDispatch>,
        events: broadcast::Sender<NetworkEvent>,
        roster: watch::Receiver<Vec<String>>,
    ) -> Self {
        let proxy_id = proxy_id.into();
        let addressed = keys::addressed_channel(&proxy_id);
        let (changes, pending_changes) = mpsc::unbounded_channel();
        let backend = store.operations().backend().clone();
        Self {
            proxy_id,
            addressed,
            store,
            backend,
            custom: Mutex::new(BTreeSet::new()),
            changes,
            pending_changes: StdMutex::new(Some(pending_changes)),
            poison: CancellationToken::new(),
            cache,
            dispatcher,
            events,
            roster,
        }
    }

    /// Open the subscription and spawn the listener. Messages published after
    /// this returns are delivered.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let changes = self
            .pending_changes
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        let Some(changes) = changes else {
            return Err(SyncError::ListenerStarted);
        };

        let subscription = self.open_reserved().await?;
        info!(proxy_id = %self.proxy_id, "event bus listening");
        Ok(tokio::spawn(self.clone().listen(subscription, changes)))
    }

    /// Stop the listener and close its subscriptions.
    pub fn poison(&self) {
        self.poison.cancel();
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.is_cancelled()
    }

    fn reserved(&self) -> [String; 3] {
        [
            self.addressed.clone(),
            keys::BROADCAST_CHANNEL.to_string(),
            keys::DATA_CHANNEL.to_string(),
        ]
    }

    async fn open_reserved(&self) -> Result<Subscription> {
        Ok(self.backend.subscribe(self.reserved().to_vec()).await?)
    }

    async fn open_custom(&self, channel: &str) -> Result<ChannelStream> {
        let subscription = self.backend.subscribe(vec![channel.to_string()]).await?;
        Ok(subscription
            .map(Some)
            .chain(stream::once(ready(None)))
            .boxed())
    }

    async fn listen(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut changes: mpsc::UnboundedReceiver<ChannelChange>,
    ) {
        let mut custom: StreamMap<String, ChannelStream> = StreamMap::new();
        loop {
            tokio::select! {
                _ = self.poison.cancelled() => break,
                Some(change) = changes.recv() => match change {
                    ChannelChange::Add(channel, stream) => {
                        debug!(%channel, "listening on custom channel");
                        custom.insert(channel, stream);
                    }
                    ChannelChange::Remove(channel) => {
                        debug!(%channel, "no longer listening on custom channel");
                        custom.remove(&channel);
                    }
                },
                message = subscription.next() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        warn!("subscription closed by the store, reopening");
                        match self.reopen().await {
                            Some(next) => subscription = next,
                            None => break,
                        }
                    }
                },
                Some((channel, message)) = custom.next(), if !custom.is_empty() => match message {
                    Some(message) => self.handle(message).await,
                    None => self.reopen_custom(&mut custom, channel).await,
                },
            }
        }
        info!(proxy_id = %self.proxy_id, "event bus listener stopped");
    }

    /// Retry opening the reserved subscription until it succeeds or the bus
    /// is poisoned.
    async fn reopen(&self) -> Option<Subscription> {
        loop {
            tokio::select! {
                _ = self.poison.cancelled() => return None,
                _ = sleep(REOPEN_DELAY) => {}
            }
            match self.open_reserved().await {
                Ok(subscription) => return Some(subscription),
                Err(err) => error!(%err, "unable to reopen subscription"),
            }
        }
    }

    async fn reopen_custom(&self, custom: &mut StreamMap<String, ChannelStream>, channel: String) {
        custom.remove(&channel);
        if !self.custom.lock().await.contains(&channel) {
            return;
        }
        warn!(%channel, "custom channel closed by the store, reopening");
        match self.open_custom(&channel).await {
            Ok(stream) => {
                custom.insert(channel, stream);
            }
            Err(err) => error!(%channel, %err, "unable to reopen custom channel"),
        }
    }

    async fn handle(&self, message: ChannelMessage) {
        let ChannelMessage { channel, payload } = message;
        if payload.trim().is_empty() {
            return;
        }

        if channel == keys::DATA_CHANNEL {
            match PresenceEvent::decode(&payload) {
                Ok(event) => self.cache.apply(event).await,
                Err(err) => warn!(%err, %payload, "skipping data message"),
            }
        } else if channel == self.addressed || channel == keys::BROADCAST_CHANNEL {
            if let Ok(command) = normalize_command(&payload) {
                let command = command.to_string();
                let dispatcher = self.dispatcher.clone();
                debug!(%channel, %command, "dispatching remote command");
                tokio::spawn(async move { dispatcher.execute(&command).await });
            }
        }

        let _ = self.events.send(NetworkEvent::PubSubMessage {
            channel,
            message: payload,
        });
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish without waiting for any receiver.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.store.publish(channel, message).await
    }

    pub async fn publish_event(&self, event: &PresenceEvent) -> Result<()> {
        self.publish(keys::DATA_CHANNEL, &event.encode()).await
    }

    /// Send command text to one live proxy, or to every proxy with `allservers`.
    pub async fn send_proxy_command(&self, target: &str, command: &str) -> Result<()> {
        let command = normalize_command(command)?;
        let channel = if target == keys::ALL_PROXIES {
            keys::BROADCAST_CHANNEL.to_string()
        } else if self.roster.borrow().iter().any(|proxy| proxy == target) {
            keys::addressed_channel(target)
        } else {
            return Err(SyncError::UnknownProxy(target.to_string()));
        };
        self.publish(&channel, command).await
    }

    pub async fn send_channel_message(&self, channel: &str, message: &str) -> Result<()> {
        validate_channel(channel)?;
        self.publish(channel, message).await
    }

    // ========================================================================
    // Channel set
    // ========================================================================

    /// Each new channel gets its own subscription; channels already
    /// subscribed are left untouched.
    pub async fn register_channels(&self, channels: &[&str]) -> Result<()> {
        for channel in channels {
            validate_channel(channel)?;
        }
        let mut custom = self.custom.lock().await;
        for channel in channels {
            if self.is_reserved(channel) || custom.contains(*channel) {
                continue;
            }
            let stream = self.open_custom(channel).await?;
            custom.insert(channel.to_string());
            // Fails only once the listener has exited.
            let _ = self.changes.send(ChannelChange::Add(channel.to_string(), stream));
        }
        Ok(())
    }

    /// The addressed, broadcast and data channels cannot be removed.
    pub async fn unregister_channels(&self, channels: &[&str]) -> Result<()> {
        if let Some(reserved) = channels.iter().find(|channel| self.is_reserved(channel)) {
            return Err(SyncError::ReservedChannel(reserved.to_string()));
        }
        let mut custom = self.custom.lock().await;
        for channel in channels {
            if custom.remove(*channel) {
                let _ = self.changes.send(ChannelChange::Remove(channel.to_string()));
            }
        }
        Ok(())
    }

    /// Every subscribed channel, reserved ones included.
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: BTreeSet<String> = self.custom.lock().await.clone();
        channels.extend(self.reserved());
        channels.into_iter().collect()
    }

    fn is_reserved(&self, channel: &str) -> bool {
        channel == self.addressed
            || channel == keys::BROADCAST_CHANNEL
            || channel == keys::DATA_CHANNEL
    }
}
