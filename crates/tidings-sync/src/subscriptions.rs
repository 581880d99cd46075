//! Reference-counted topic subscriptions.
//!
//! Many call sites may want the same topic. Only the first acquirer causes a
//! subscribe and only the last release causes an unsubscribe. While the
//! transport is down, acquisitions are recorded and replayed by
//! [`SubscriptionManager::on_connected`]. A topic nobody holds any more is
//! evicted from the cache, so the cache only keeps what is being watched.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::store::CacheStore;
use crate::topic::Topic;
use crate::transport::Transport;

#[derive(Debug)]
struct Entry {
    ref_count: NonZeroUsize,
    /// Subscribed on the current connection.
    active: bool,
}

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    /// Bumped on teardown; handles from an older generation are inert.
    generation: u64,
    topics: HashMap<Topic, Entry>,
}

/// Owns the set of topics the application cares about.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    /// Collections of released topics are evicted from here.
    cache: Option<Arc<CacheStore>>,
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    /// A manager that only tracks transport subscriptions.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cache: None,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// A manager that also evicts a topic's cached collection when its
    /// last handle is released.
    pub fn with_cache(transport: Arc<dyn Transport>, cache: Arc<CacheStore>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cache: Some(cache),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `topic`.
    ///
    /// Subscribes on the transport if this is the first acquirer and the
    /// connection is live; otherwise the subscribe is deferred until connect.
    /// Dropping the returned handle releases it.
    pub fn acquire(self: &Arc<Self>, topic: &Topic) -> SubscriptionHandle {
        let mut inner = self.lock();
        let connected = inner.connected;
        let generation = inner.generation;

        match inner.topics.get_mut(topic) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_add(1);
                debug!(topic = %topic, refs = entry.ref_count.get(), "subscription shared");
            }
            None => {
                let active = connected && self.send_subscribe(topic);
                inner.topics.insert(
                    topic.clone(),
                    Entry {
                        ref_count: NonZeroUsize::MIN,
                        active,
                    },
                );
                debug!(topic = %topic, active, "subscription added");
            }
        }

        SubscriptionHandle {
            topic: topic.clone(),
            generation,
            manager: Arc::downgrade(self),
            released: false,
        }
    }

    /// Give up a handle. Same as dropping it.
    pub fn release(&self, handle: SubscriptionHandle) {
        handle.release();
    }

    fn release_topic(&self, topic: &Topic, generation: u64) {
        if !self.release_ref(topic, generation) {
            return;
        }
        // Outside the lock: eviction notifies cache watchers.
        if let Some(cache) = &self.cache {
            cache.evict(topic);
        }
    }

    /// Drop one reference. Returns whether it was the last one.
    fn release_ref(&self, topic: &Topic, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(topic = %topic, "ignoring release from a torn-down session");
            return false;
        }
        let connected = inner.connected;

        let Some(entry) = inner.topics.get_mut(topic) else {
            return false;
        };
        match NonZeroUsize::new(entry.ref_count.get() - 1) {
            Some(remaining) => {
                entry.ref_count = remaining;
                debug!(topic = %topic, refs = remaining.get(), "subscription released");
                false
            }
            None => {
                let was_active = entry.active;
                inner.topics.remove(topic);
                if connected && was_active {
                    self.send_unsubscribe(topic);
                }
                debug!(topic = %topic, "subscription removed");
                true
            }
        }
    }

    fn send_subscribe(&self, topic: &Topic) -> bool {
        match self.transport.subscribe(topic) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "subscribe failed, will retry on reconnect");
                false
            }
        }
    }

    fn send_unsubscribe(&self, topic: &Topic) {
        if let Err(e) = self.transport.unsubscribe(topic) {
            warn!(topic = %topic, error = %e, "unsubscribe failed");
        }
    }

    /// The connection is live: subscribe every topic that is not yet active.
    ///
    /// Returns the number of subscribes issued.
    pub fn on_connected(&self) -> usize {
        let mut inner = self.lock();
        inner.connected = true;

        let mut issued = 0;
        for (topic, entry) in inner.topics.iter_mut() {
            if !entry.active && self.send_subscribe(topic) {
                entry.active = true;
                issued += 1;
            }
        }
        debug!(issued, "subscriptions replayed");
        issued
    }

    /// The connection is gone: nothing is subscribed any more.
    pub fn on_disconnected(&self) {
        let mut inner = self.lock();
        inner.connected = false;
        for entry in inner.topics.values_mut() {
            entry.active = false;
        }
    }

    /// Unsubscribe everything and forget all interest.
    ///
    /// Outstanding handles become inert.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        if inner.connected {
            for (topic, entry) in &inner.topics {
                if entry.active {
                    self.send_unsubscribe(topic);
                }
            }
        }
        let dropped = inner.topics.len();
        inner.topics.clear();
        inner.connected = false;
        inner.generation += 1;
        debug!(dropped, "subscriptions torn down");
    }

    /// Current reference count of a topic (0 if unknown).
    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |e| e.ref_count.get())
    }

    /// Whether a topic is subscribed on the current connection.
    pub fn is_active(&self, topic: &Topic) -> bool {
        self.lock().topics.get(topic).is_some_and(|e| e.active)
    }

    /// Every topic with at least one holder.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Disposable interest in a topic.
#[derive(Debug)]
#[must_use = "dropping the handle releases the subscription"]
pub struct SubscriptionHandle {
    topic: Topic,
    generation: u64,
    manager: Weak<SubscriptionManager>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Release now instead of on drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.release_topic(&self.topic, self.generation);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}
