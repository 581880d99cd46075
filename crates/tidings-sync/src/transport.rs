//! The pub/sub transport seam.
//!
//! A transport owns one authenticated connection and multiplexes topics
//! over it. The engine only relies on three things: `subscribe`,
//! `unsubscribe`, and an at-least-once stream of publications per topic.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::topic::Topic;
use crate::types::Credential;

/// Something the connection delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A publication on a subscribed topic; `payload` is the raw `{type, payload}` JSON.
    Publication { topic: Topic, payload: String },
    /// The connection ended.
    Closed { reason: String },
}

/// Stream of events for one connection. Ends when the connection is gone.
pub type Publications = mpsc::UnboundedReceiver<TransportEvent>;

/// A multiplexed publish/subscribe connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection authenticated with `credential`.
    ///
    /// Any previous connection is replaced. Subscriptions do not carry over:
    /// the caller resubscribes after every successful connect.
    async fn connect(&self, credential: &Credential) -> Result<Publications, TransportError>;

    /// Queue a subscribe request on the live connection.
    fn subscribe(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Queue an unsubscribe request on the live connection.
    fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Close the connection, if any. Idempotent.
    async fn close(&self);
}
