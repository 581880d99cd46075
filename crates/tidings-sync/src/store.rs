//! In-memory cache of chat entities, keyed by topic.
//!
//! The store is the only place cached state changes. The event router and
//! the mutation coordinator both write through it, UI code only reads
//! snapshots and listens for [`CacheUpdate`]s.
//!
//! Each topic owns one ordered collection: channel topics hold messages,
//! workspace topics hold channels, the app topic holds workspaces. Every
//! operation on a topic runs under that topic's map shard lock, so a
//! single call is atomic with respect to every other writer.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::topic::Topic;
use crate::types::{Entity, Message, Reaction};

/// Notification sent to store subscribers after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    /// A new entity was appended or inserted.
    Inserted {
        topic: Topic,
        id: String,
        index: usize,
    },
    /// An entity changed in place.
    Updated { topic: Topic, id: String },
    /// An entity was removed.
    Removed { topic: Topic, id: String },
    /// A provisional entity was superseded by its confirmed counterpart.
    Replaced {
        topic: Topic,
        temp_id: String,
        id: String,
    },
    /// Many entries changed at once; re-read the collection.
    Reloaded { topic: Topic },
    /// The member roster changed.
    MembersChanged { topic: Topic },
    /// The set of typing users changed.
    TypingChanged { topic: Topic },
    /// Everything was dropped (teardown).
    Cleared,
}

impl CacheUpdate {
    /// Topic this update concerns, `None` for [`CacheUpdate::Cleared`].
    pub fn topic(&self) -> Option<&Topic> {
        match self {
            CacheUpdate::Inserted { topic, .. }
            | CacheUpdate::Updated { topic, .. }
            | CacheUpdate::Removed { topic, .. }
            | CacheUpdate::Replaced { topic, .. }
            | CacheUpdate::Reloaded { topic }
            | CacheUpdate::MembersChanged { topic }
            | CacheUpdate::TypingChanged { topic } => Some(topic),
            CacheUpdate::Cleared => None,
        }
    }
}

/// Result of [`CacheStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New id, appended at this index.
    Inserted(usize),
    /// Known id, replaced in place at this index.
    Updated(usize),
    /// Known id with an identical value.
    Unchanged,
    /// The id was deleted by the server and is not resurrected.
    Tombstoned,
}

/// Result of [`CacheStore::replace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The provisional entry was swapped for the confirmed one in place.
    Replaced(usize),
    /// The confirmed id was already present (pushed first); the provisional
    /// entry was dropped and the confirmed one updated at this index.
    Merged(usize),
    /// Neither was present; the confirmed entity was appended.
    Appended(usize),
    /// The confirmed id was deleted by the server; nothing was inserted.
    Tombstoned,
}

/// Recently deleted ids, oldest evicted first.
#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn insert(&mut self, id: &str, capacity: usize) {
        if capacity == 0 || !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Everything cached for one topic.
#[derive(Debug, Default)]
struct Collection {
    entities: Vec<Entity>,
    tombstones: Tombstones,
    members: BTreeSet<String>,
    typing: HashMap<String, Instant>,
    loaded: bool,
}

impl Collection {
    fn position(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.id() == id)
    }
}

/// The authoritative in-memory projection of cached entities.
pub struct CacheStore {
    collections: DashMap<Topic, Collection>,
    updates_tx: broadcast::Sender<CacheUpdate>,
    tombstone_capacity: usize,
    typing_ttl: Duration,
    /// Bumped on every [`CacheStore::clear`].
    epoch: AtomicU64,
}

impl CacheStore {
    /// Create an empty store with default settings.
    pub fn new() -> Arc<Self> {
        Self::with_config(&SyncConfig::default())
    }

    /// Create an empty store sized from `config`.
    pub fn with_config(config: &SyncConfig) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(config.update_buffer.max(1));
        Arc::new(Self {
            collections: DashMap::new(),
            updates_tx,
            tombstone_capacity: config.tombstone_capacity,
            typing_ttl: config.typing_ttl,
            epoch: AtomicU64::new(0),
        })
    }

    /// Subscribe to every update.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    /// Subscribe to the updates of one topic.
    pub fn watch(&self, topic: &Topic) -> TopicWatch {
        TopicWatch {
            topic: topic.clone(),
            rx: self.updates_tx.subscribe(),
        }
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    /// Current epoch. Work that started under an older epoch must not write.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot of the ordered collection for a topic.
    pub fn get(&self, topic: &Topic) -> Vec<Entity> {
        self.collections
            .get(topic)
            .map(|c| c.entities.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the messages in a channel topic.
    pub fn messages(&self, topic: &Topic) -> Vec<Message> {
        self.collections
            .get(topic)
            .map(|c| {
                c.entities
                    .iter()
                    .filter_map(|e| e.as_message().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One entity by id.
    pub fn get_entity(&self, topic: &Topic, id: &str) -> Option<Entity> {
        let collection = self.collections.get(topic)?;
        collection.entities.iter().find(|e| e.id() == id).cloned()
    }

    /// Index of an entity by id.
    pub fn position(&self, topic: &Topic, id: &str) -> Option<usize> {
        self.collections.get(topic)?.position(id)
    }

    /// Number of entities cached for a topic.
    pub fn len(&self, topic: &Topic) -> usize {
        self.collections.get(topic).map_or(0, |c| c.entities.len())
    }

    pub fn is_empty(&self, topic: &Topic) -> bool {
        self.len(topic) == 0
    }

    /// Whether REST history has been merged into this topic.
    pub fn is_loaded(&self, topic: &Topic) -> bool {
        self.collections.get(topic).is_some_and(|c| c.loaded)
    }

    /// Whether the server deleted this id (and the deletion is still remembered).
    pub fn is_tombstoned(&self, topic: &Topic, id: &str) -> bool {
        self.collections
            .get(topic)
            .is_some_and(|c| c.tombstones.contains(id))
    }

    /// Topics with cached state.
    pub fn topics(&self) -> Vec<Topic> {
        self.collections.iter().map(|r| r.key().clone()).collect()
    }

    // =========================================================================
    // Entity writes
    // =========================================================================

    /// Insert or replace an entity by id.
    ///
    /// A new id is appended; a known id is replaced at its current position.
    pub fn upsert(&self, topic: &Topic, entity: Entity) -> UpsertOutcome {
        let id = entity.id().to_string();
        let outcome = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            if collection.tombstones.contains(&id) {
                UpsertOutcome::Tombstoned
            } else {
                match collection.position(&id) {
                    Some(i) if collection.entities[i] == entity => UpsertOutcome::Unchanged,
                    Some(i) => {
                        collection.entities[i] = entity;
                        UpsertOutcome::Updated(i)
                    }
                    None => {
                        collection.entities.push(entity);
                        UpsertOutcome::Inserted(collection.entities.len() - 1)
                    }
                }
            }
        };

        match outcome {
            UpsertOutcome::Inserted(index) => {
                trace!(topic = %topic, id = %id, index, "cache: entity inserted");
                self.broadcast(CacheUpdate::Inserted {
                    topic: topic.clone(),
                    id,
                    index,
                });
            }
            UpsertOutcome::Updated(_) => {
                trace!(topic = %topic, id = %id, "cache: entity updated");
                self.broadcast(CacheUpdate::Updated {
                    topic: topic.clone(),
                    id,
                });
            }
            UpsertOutcome::Unchanged => {}
            UpsertOutcome::Tombstoned => {
                debug!(topic = %topic, id = %id, "cache: ignoring write for deleted entity");
            }
        }
        outcome
    }

    /// Upsert a server-confirmed entity.
    ///
    /// If it carries a nonce that names a provisional entry in the same
    /// collection, that entry is replaced in place instead of appending a
    /// second copy.
    pub fn reconcile(&self, topic: &Topic, entity: Entity) -> UpsertOutcome {
        let provisional = entity.nonce().and_then(|nonce| {
            let collection = self.collections.get(topic)?;
            let pending = collection
                .entities
                .iter()
                .any(|e| e.id() == nonce && e.as_message().is_some_and(Message::is_pending));
            pending.then(|| nonce.to_string())
        });

        match provisional {
            Some(temp_id) => match self.replace(topic, &temp_id, entity) {
                ReplaceOutcome::Replaced(i) | ReplaceOutcome::Merged(i) => {
                    UpsertOutcome::Updated(i)
                }
                ReplaceOutcome::Appended(i) => UpsertOutcome::Inserted(i),
                ReplaceOutcome::Tombstoned => UpsertOutcome::Tombstoned,
            },
            None => self.upsert(topic, entity),
        }
    }

    /// Remove an entity without remembering the deletion.
    ///
    /// Used for optimistic removals, which may still be rolled back.
    /// Returns the removed entity and its former index.
    pub fn remove(&self, topic: &Topic, id: &str) -> Option<(usize, Entity)> {
        let removed = {
            let mut collection = self.collections.get_mut(topic)?;
            let i = collection.position(id)?;
            let entity = collection.entities.remove(i);
            (i, entity)
        };
        trace!(topic = %topic, id = %id, "cache: entity removed");
        self.broadcast(CacheUpdate::Removed {
            topic: topic.clone(),
            id: id.to_string(),
        });
        Some(removed)
    }

    /// Remove an entity the server has deleted and remember the deletion.
    ///
    /// A no-op (apart from the tombstone) when the id is absent.
    pub fn apply_deletion(&self, topic: &Topic, id: &str) -> Option<(usize, Entity)> {
        let removed = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            collection.tombstones.insert(id, self.tombstone_capacity);
            collection
                .position(id)
                .map(|i| (i, collection.entities.remove(i)))
        };
        if removed.is_some() {
            trace!(topic = %topic, id = %id, "cache: entity deleted");
            self.broadcast(CacheUpdate::Removed {
                topic: topic.clone(),
                id: id.to_string(),
            });
        }
        removed
    }

    /// Atomically swap a provisional entity (by temp id) for its confirmed form.
    ///
    /// Never leaves two entries with the confirmed id: if the confirmed id
    /// arrived first, the provisional entry is dropped and the existing one
    /// updated in place.
    pub fn replace(&self, topic: &Topic, temp_id: &str, entity: Entity) -> ReplaceOutcome {
        let id = entity.id().to_string();
        let (outcome, changed) = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            let temp_pos = collection.position(temp_id);

            if collection.tombstones.contains(&id) {
                if let Some(t) = temp_pos {
                    collection.entities.remove(t);
                }
                (ReplaceOutcome::Tombstoned, temp_pos.is_some())
            } else {
                match (temp_pos, collection.position(&id)) {
                    (temp, Some(i)) => {
                        let mut changed = collection.entities[i] != entity;
                        collection.entities[i] = entity;
                        let mut index = i;
                        if let Some(t) = temp
                            && t != i
                        {
                            collection.entities.remove(t);
                            changed = true;
                            if t < i {
                                index -= 1;
                            }
                        }
                        (ReplaceOutcome::Merged(index), changed)
                    }
                    (Some(t), None) => {
                        collection.entities[t] = entity;
                        (ReplaceOutcome::Replaced(t), true)
                    }
                    (None, None) => {
                        collection.entities.push(entity);
                        let index = collection.entities.len() - 1;
                        (ReplaceOutcome::Appended(index), true)
                    }
                }
            }
        };

        trace!(topic = %topic, temp_id, id = %id, ?outcome, "cache: provisional entity reconciled");
        if changed {
            let update = match outcome {
                ReplaceOutcome::Appended(index) => CacheUpdate::Inserted {
                    topic: topic.clone(),
                    id,
                    index,
                },
                ReplaceOutcome::Tombstoned => CacheUpdate::Removed {
                    topic: topic.clone(),
                    id: temp_id.to_string(),
                },
                ReplaceOutcome::Replaced(_) | ReplaceOutcome::Merged(_) => CacheUpdate::Replaced {
                    topic: topic.clone(),
                    temp_id: temp_id.to_string(),
                    id,
                },
            };
            self.broadcast(update);
        }
        outcome
    }

    /// Modify one entity in place.
    ///
    /// Returns the value before and after `f`, or `None` if the id is absent.
    pub fn update<F>(&self, topic: &Topic, id: &str, f: F) -> Option<(Entity, Entity)>
    where
        F: FnOnce(&mut Entity),
    {
        let (before, after) = {
            let mut collection = self.collections.get_mut(topic)?;
            let i = collection.position(id)?;
            let before = collection.entities[i].clone();
            f(&mut collection.entities[i]);
            (before, collection.entities[i].clone())
        };
        if before != after {
            trace!(topic = %topic, id, "cache: entity modified");
            self.broadcast(CacheUpdate::Updated {
                topic: topic.clone(),
                id: id.to_string(),
            });
        }
        Some((before, after))
    }

    /// Put back an optimistically removed entity at (or near) its old index.
    ///
    /// Skipped when the id is present again or the server has deleted it.
    pub fn restore(&self, topic: &Topic, index: usize, entity: Entity) -> bool {
        let id = entity.id().to_string();
        let index = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            if collection.tombstones.contains(&id) || collection.position(&id).is_some() {
                return false;
            }
            let index = index.min(collection.entities.len());
            collection.entities.insert(index, entity);
            index
        };
        trace!(topic = %topic, id = %id, index, "cache: entity restored");
        self.broadcast(CacheUpdate::Inserted {
            topic: topic.clone(),
            id,
            index,
        });
        true
    }

    /// Roll an entity back to `previous`, but only while it still equals
    /// `expected` (the optimistic value). A newer server write wins.
    pub fn restore_if_current(&self, topic: &Topic, expected: &Entity, previous: Entity) -> bool {
        let id = expected.id().to_string();
        {
            let Some(mut collection) = self.collections.get_mut(topic) else {
                return false;
            };
            let Some(i) = collection.position(&id) else {
                return false;
            };
            if collection.entities[i] != *expected {
                return false;
            }
            collection.entities[i] = previous;
        }
        trace!(topic = %topic, id = %id, "cache: entity rolled back");
        self.broadcast(CacheUpdate::Updated {
            topic: topic.clone(),
            id,
        });
        true
    }

    /// Replace a message's reaction summary.
    pub fn set_reactions(&self, topic: &Topic, message_id: &str, reactions: Vec<Reaction>) -> bool {
        self.update(topic, message_id, |entity| {
            if let Some(message) = entity.as_message_mut() {
                message.reactions = reactions;
            }
        })
        .is_some_and(|(before, after)| before != after)
    }

    /// Merge a page of REST history into a topic.
    ///
    /// Live entries win over history for the same id. New ids are merged
    /// in by `created_at` (stable, so equal timestamps keep their order)
    /// and tombstoned ids are skipped. Returns the number of entities added.
    pub fn hydrate(&self, topic: &Topic, history: Vec<Entity>) -> usize {
        let added = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            let mut added = 0;
            for entity in history {
                if collection.tombstones.contains(entity.id())
                    || collection.position(entity.id()).is_some()
                {
                    continue;
                }
                collection.entities.push(entity);
                added += 1;
            }
            collection.entities.sort_by_key(Entity::created_at);
            collection.loaded = true;
            added
        };
        debug!(topic = %topic, added, "cache: history merged");
        self.broadcast(CacheUpdate::Reloaded {
            topic: topic.clone(),
        });
        added
    }

    // =========================================================================
    // Membership and typing
    // =========================================================================

    /// Member ids of a channel or workspace topic.
    pub fn members(&self, topic: &Topic) -> BTreeSet<String> {
        self.collections
            .get(topic)
            .map(|c| c.members.clone())
            .unwrap_or_default()
    }

    pub fn add_member(&self, topic: &Topic, user_id: &str) -> bool {
        let added = self
            .collections
            .entry(topic.clone())
            .or_default()
            .members
            .insert(user_id.to_string());
        if added {
            self.broadcast(CacheUpdate::MembersChanged {
                topic: topic.clone(),
            });
        }
        added
    }

    pub fn remove_member(&self, topic: &Topic, user_id: &str) -> bool {
        let removed = self
            .collections
            .get_mut(topic)
            .is_some_and(|mut c| c.members.remove(user_id));
        if removed {
            self.broadcast(CacheUpdate::MembersChanged {
                topic: topic.clone(),
            });
        }
        removed
    }

    /// Users currently typing in a channel topic (expired entries excluded).
    pub fn typing(&self, topic: &Topic) -> BTreeSet<String> {
        let now = Instant::now();
        self.collections
            .get(topic)
            .map(|c| {
                c.typing
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a user as typing until the typing TTL elapses.
    pub fn start_typing(&self, topic: &Topic, user_id: &str) {
        let now = Instant::now();
        let was_typing = {
            let mut collection = self.collections.entry(topic.clone()).or_default();
            collection.typing.retain(|_, expires| *expires > now);
            collection
                .typing
                .insert(user_id.to_string(), now + self.typing_ttl)
                .is_some()
        };
        if !was_typing {
            self.broadcast(CacheUpdate::TypingChanged {
                topic: topic.clone(),
            });
        }
    }

    pub fn stop_typing(&self, topic: &Topic, user_id: &str) -> bool {
        let removed = self
            .collections
            .get_mut(topic)
            .is_some_and(|mut c| c.typing.remove(user_id).is_some());
        if removed {
            self.broadcast(CacheUpdate::TypingChanged {
                topic: topic.clone(),
            });
        }
        removed
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drop everything cached for one topic.
    pub fn evict(&self, topic: &Topic) {
        if self.collections.remove(topic).is_some() {
            debug!(topic = %topic, "cache: topic evicted");
            self.broadcast(CacheUpdate::Reloaded {
                topic: topic.clone(),
            });
        }
    }

    /// Drop all cached state and start a new epoch.
    pub fn clear(&self) {
        self.collections.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.broadcast(CacheUpdate::Cleared);
        debug!("cache cleared");
    }
}

/// Receiver for the updates of a single topic.
pub struct TopicWatch {
    topic: Topic,
    rx: broadcast::Receiver<CacheUpdate>,
}

impl TopicWatch {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next update to this topic.
    ///
    /// A lagged receiver yields [`CacheUpdate::Reloaded`] so the consumer
    /// re-reads the snapshot. Returns `None` once the store is dropped.
    pub async fn recv(&mut self) -> Option<CacheUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => {
                    if update.topic().is_none_or(|t| *t == self.topic) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(topic = %self.topic, skipped, "topic watch lagged");
                    return Some(CacheUpdate::Reloaded {
                        topic: self.topic.clone(),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`TopicWatch::recv`].
    pub fn try_recv(&mut self) -> Option<CacheUpdate> {
        loop {
            match self.rx.try_recv() {
                Ok(update) => {
                    if update.topic().is_none_or(|t| *t == self.topic) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    return Some(CacheUpdate::Reloaded {
                        topic: self.topic.clone(),
                    });
                }
                Err(_) => return None,
            }
        }
    }
}
