//! Connection lifecycle.
//!
//! Owns the single transport connection for a session: connects with the
//! session credential, replays every active subscription once connected,
//! feeds publications to the [`EventRouter`], and reconnects with backoff
//! after a drop until shut down.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::config::ReconnectConfig;
use crate::router::{Dispatch, EventRouter};
use crate::subscriptions::SubscriptionManager;
use crate::topic::Topic;
use crate::transport::{Publications, Transport, TransportEvent};
use crate::types::Credential;

/// Connection state, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// First connect of a session in progress.
    Connecting,
    /// Connected; subscriptions are live.
    Connected,
    /// Reconnecting after a drop or a failed connect.
    Reconnecting { attempt: u32 },
    /// Gave up after too many failed attempts.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Drives one session's connection until shutdown.
pub(crate) struct ConnectionLifecycle {
    pub transport: Arc<dyn Transport>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub router: Arc<EventRouter>,
    pub api: Arc<dyn ChatApi>,
    pub reconnect: ReconnectConfig,
    pub state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionLifecycle {
    fn set_state(&self, state: ConnectionState) {
        debug!(state = ?state, "connection state");
        self.state_tx.send_replace(state);
    }

    /// Connect, pump, and reconnect until `shutdown_rx` fires.
    pub async fn run(self, credential: Credential, mut shutdown_rx: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        let mut failures = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            let result = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                result = self.transport.connect(&credential) => result,
            };

            let delay = match result {
                Ok(publications) => {
                    attempt = 0;
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    let resubscribed = self.subscriptions.on_connected();
                    info!(resubscribed, "connected");

                    let Some(reason) = self.pump(publications, &mut shutdown_rx).await else {
                        break;
                    };
                    self.subscriptions.on_disconnected();
                    self.set_state(ConnectionState::Disconnected);
                    warn!(reason = %reason, "connection lost, reconnecting");
                    self.reconnect.delay_for_attempt(0)
                }
                Err(e) => {
                    failures += 1;
                    if !self.reconnect.allows(failures) {
                        warn!(error = %e, failures, "giving up on connection");
                        self.set_state(ConnectionState::Failed {
                            reason: e.to_string(),
                        });
                        let _ = shutdown_rx.changed().await;
                        break;
                    }
                    let delay = self.reconnect.delay_for_attempt(failures - 1);
                    let delay_ms = delay.as_millis() as u64;
                    warn!(error = %e, failures, delay_ms, "connect failed");
                    delay
                }
            };

            attempt += 1;
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.subscriptions.on_disconnected();
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("connection lifecycle stopped");
    }

    /// Deliver events until the connection closes (returns the reason) or
    /// shutdown is requested (returns `None`).
    async fn pump(
        &self,
        mut publications: Publications,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return None,
                event = publications.recv() => match event {
                    Some(TransportEvent::Publication { topic, payload }) => {
                        self.dispatch(&topic, &payload)
                    }
                    Some(TransportEvent::Closed { reason }) => return Some(reason),
                    None => return Some("stream ended".to_string()),
                },
            }
        }
    }

    fn dispatch(&self, topic: &Topic, payload: &str) {
        let dispatch = self.router.handle_publication(topic, payload);
        if let Dispatch::RefreshReactions(refresh) = dispatch {
            let router = Arc::clone(&self.router);
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                if let Err(e) = router.refresh_reactions(api.as_ref(), &refresh).await {
                    warn!(message_id = %refresh.message_id, error = %e, "reaction refresh failed");
                }
            });
        }
    }
}
