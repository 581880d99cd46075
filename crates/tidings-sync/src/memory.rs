//! In-process transport.
//!
//! Single-process only: publications go straight from [`MemoryTransport::publish`]
//! to the connected engine. Useful for embedding the engine without a server
//! and for driving it deterministically in tests (drops, outages, and the
//! exact subscribe/unsubscribe traffic are all observable).

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::event::ServerEvent;
use crate::topic::Topic;
use crate::transport::{Publications, Transport, TransportEvent};
use crate::types::Credential;

/// A subscribe or unsubscribe request as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

#[derive(Default)]
struct Inner {
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    subscribed: BTreeSet<Topic>,
    ops: Vec<SubscriptionOp>,
    connects: u32,
    fail_next: u32,
}

/// Loopback pub/sub transport.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event on a topic.
    ///
    /// Delivered only if connected and subscribed to `topic`; returns
    /// whether it was delivered.
    pub fn publish(&self, topic: &Topic, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(payload) => self.publish_raw(topic, payload),
            Err(e) => {
                debug!(error = %e, "failed to encode event");
                false
            }
        }
    }

    /// Publish an arbitrary payload (possibly malformed) on a topic.
    pub fn publish_raw(&self, topic: &Topic, payload: impl Into<String>) -> bool {
        let inner = self.lock();
        if !inner.subscribed.contains(topic) {
            trace!(topic = %topic, "memory transport: no subscriber for topic");
            return false;
        }
        let Some(sender) = &inner.sender else {
            return false;
        };
        sender
            .send(TransportEvent::Publication {
                topic: topic.clone(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Simulate a network drop: the live connection closes and its
    /// subscriptions are forgotten.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        if let Some(sender) = inner.sender.take() {
            let _ = sender.send(TransportEvent::Closed {
                reason: "connection dropped".to_string(),
            });
        }
        inner.subscribed.clear();
        debug!("memory transport: connection dropped");
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Topics subscribed on the live connection.
    pub fn subscribed(&self) -> BTreeSet<Topic> {
        self.lock().subscribed.clone()
    }

    /// Every subscribe/unsubscribe request received, in order.
    pub fn ops(&self) -> Vec<SubscriptionOp> {
        self.lock().ops.clone()
    }

    /// Forget the recorded requests.
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Number of subscribe requests recorded for `topic`.
    pub fn subscribe_count(&self, topic: &Topic) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, SubscriptionOp::Subscribe(t) if t == topic))
            .count()
    }

    /// Number of unsubscribe requests recorded for `topic`.
    pub fn unsubscribe_count(&self, topic: &Topic) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, SubscriptionOp::Unsubscribe(t) if t == topic))
            .count()
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, credential: &Credential) -> Result<Publications, TransportError> {
        if credential.token().is_empty() {
            return Err(TransportError::InvalidCredential("empty token".to_string()));
        }

        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TransportError::Connect("simulated outage".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.sender = Some(tx);
        inner.subscribed.clear();
        inner.connects += 1;
        debug!(connects = inner.connects, "memory transport: connected");
        Ok(rx)
    }

    fn subscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.sender.is_none() {
            return Err(TransportError::NotConnected);
        }
        inner.subscribed.insert(topic.clone());
        inner.ops.push(SubscriptionOp::Subscribe(topic.clone()));
        Ok(())
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.sender.is_none() {
            return Err(TransportError::NotConnected);
        }
        inner.subscribed.remove(topic);
        inner.ops.push(SubscriptionOp::Unsubscribe(topic.clone()));
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.lock();
        inner.sender = None;
        inner.subscribed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Typing;

    fn typing() -> ServerEvent {
        ServerEvent::TypingStarted(Typing {
            user_id: "bob".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_only_to_subscribed_topics() {
        let transport = MemoryTransport::new();
        let mut rx = transport.connect(&Credential::new("t")).await.unwrap();
        let topic = Topic::from_raw("channel:app:c1");

        assert!(!transport.publish(&topic, &typing()));
        transport.subscribe(&topic).unwrap();
        assert!(transport.publish(&topic, &typing()));

        match rx.recv().await {
            Some(TransportEvent::Publication { topic: t, payload }) => {
                assert_eq!(t, topic);
                assert_eq!(ServerEvent::decode(&payload).unwrap(), typing());
            }
            other => panic!("expected publication, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.subscribe(&Topic::from_raw("app")),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_drop_connection_closes_stream() {
        let transport = MemoryTransport::new();
        let mut rx = transport.connect(&Credential::new("t")).await.unwrap();
        transport.subscribe(&Topic::from_raw("app")).unwrap();

        transport.drop_connection();
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
        assert!(rx.recv().await.is_none());
        assert!(transport.subscribed().is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(2);
        let credential = Credential::new("t");

        assert!(transport.connect(&credential).await.is_err());
        assert!(transport.connect(&credential).await.is_err());
        assert!(transport.connect(&credential).await.is_ok());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_credential_rejected() {
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.connect(&Credential::new("")).await,
            Err(TransportError::InvalidCredential(_))
        ));
    }
}
