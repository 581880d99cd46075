//! The sync engine: wires the components together for one session at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::config::SyncConfig;
use crate::connection::{ConnectionLifecycle, ConnectionState};
use crate::error::SyncError;
use crate::mutation::MutationCoordinator;
use crate::router::EventRouter;
use crate::store::CacheStore;
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::topic::{Scope, TopicRegistry};
use crate::transport::Transport;
use crate::types::{Entity, Session};

/// Messages fetched by [`SyncEngine::load_history`].
pub const HISTORY_PAGE_SIZE: usize = 50;

struct Running {
    session: Session,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Keeps the local chat cache in sync with the server.
///
/// Construct one per application and pass it where it is needed; it is not
/// a global. [`start`](SyncEngine::start) begins a session and
/// [`stop`](SyncEngine::stop) ends it and clears all state.
pub struct SyncEngine {
    config: SyncConfig,
    registry: TopicRegistry,
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    api: Arc<dyn ChatApi>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<EventRouter>,
    mutations: Arc<MutationCoordinator>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    /// Build an engine. Nothing connects until [`start`](SyncEngine::start).
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let registry = TopicRegistry::new(config.app_id.clone());
        let store = CacheStore::with_config(&config);
        let subscriptions =
            SubscriptionManager::with_cache(Arc::clone(&transport), Arc::clone(&store));
        let router = Arc::new(EventRouter::new(Arc::clone(&store), registry.clone()));
        let mutations = Arc::new(MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&api),
            registry.clone(),
            config.mutation_timeout,
        ));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            config,
            registry,
            store,
            transport,
            api,
            subscriptions,
            router,
            mutations,
            state_tx: Arc::new(state_tx),
            running: Mutex::new(None),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a session: connect in the background and keep reconnecting
    /// until [`stop`](SyncEngine::stop). A running session is stopped first.
    pub async fn start(&self, session: Session) {
        self.stop().await;

        self.mutations.set_session(Some(session.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lifecycle = ConnectionLifecycle {
            transport: Arc::clone(&self.transport),
            subscriptions: Arc::clone(&self.subscriptions),
            router: Arc::clone(&self.router),
            api: Arc::clone(&self.api),
            reconnect: self.config.reconnect.clone(),
            state_tx: Arc::clone(&self.state_tx),
        };
        let task = tokio::spawn(lifecycle.run(session.credential.clone(), shutdown_rx));

        info!(user_id = %session.user_id, app_id = %self.config.app_id, "sync engine started");
        *self.running() = Some(Running {
            session,
            shutdown_tx,
            task,
        });
    }

    /// End the session: unsubscribe everything, close the connection, and
    /// drop all cached state and pending mutations. Handles and in-flight
    /// completions from the ended session become inert. No-op if not started.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };

        self.subscriptions.teardown();
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.task.await {
            warn!(error = %e, "connection task ended abnormally");
        }

        self.mutations.clear();
        self.store.clear();
        info!(user_id = %running.session.user_id, "sync engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// The active session, if started.
    pub fn session(&self) -> Option<Session> {
        self.running().as_ref().map(|r| r.session.clone())
    }

    /// Express interest in a scope's topic. Dropping the handle releases it.
    pub fn subscribe(&self, scope: &Scope) -> SubscriptionHandle {
        let topic = self.registry.topic_for(scope);
        debug!(topic = %topic, "subscribing");
        self.subscriptions.acquire(&topic)
    }

    /// Fetch recent channel history over REST and merge it into the cache.
    ///
    /// Returns the number of messages added. Discarded if the session ends
    /// while the request is in flight.
    pub async fn load_history(&self, channel_id: &str) -> Result<usize, SyncError> {
        if !self.is_running() {
            return Err(SyncError::NotStarted);
        }
        let topic = self.registry.channel(channel_id);
        let epoch = self.store.epoch();

        let messages = self.api.fetch_messages(channel_id, HISTORY_PAGE_SIZE).await?;
        if self.store.epoch() != epoch {
            debug!(channel_id, "discarding history from previous session");
            return Ok(0);
        }
        let added = self
            .store
            .hydrate(&topic, messages.into_iter().map(Entity::Message).collect());
        debug!(channel_id, added, "history loaded");
        Ok(added)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn mutations(&self) -> &Arc<MutationCoordinator> {
        &self.mutations
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}
