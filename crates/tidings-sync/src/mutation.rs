//! Optimistic mutations.
//!
//! Every local write runs in three phases against the [`CacheStore`]:
//!
//! 1. **apply**: the expected result is written immediately and the
//!    previous state of the single affected entity is captured;
//! 2. **commit**: the server's authoritative entity replaces the optimistic one;
//! 3. **rollback**: on error or timeout the captured state is restored.
//!
//! Mutations against the same target run one at a time, in the order they
//! were issued. Work completing after [`CacheStore::clear`] is discarded.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::api::ChatApi;
use crate::error::{ApiError, MutationError};
use crate::store::CacheStore;
use crate::topic::{Topic, TopicRegistry};
use crate::types::{DeliveryState, Entity, Message, Session};

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Send,
    Edit,
    Delete,
    React,
    Unreact,
    Pin,
    Unpin,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Send => "send",
            MutationKind::Edit => "edit",
            MutationKind::Delete => "delete",
            MutationKind::React => "react",
            MutationKind::Unreact => "unreact",
            MutationKind::Pin => "pin",
            MutationKind::Unpin => "unpin",
        }
    }
}

/// State of one entity captured before an optimistic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: usize,
    pub entity: Entity,
}

/// A write that has been applied locally and awaits the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    /// Unique id of this mutation. For sends it is also the provisional
    /// message id and the nonce sent to the server.
    pub temp_id: String,
    pub kind: MutationKind,
    pub topic: Topic,
    /// Id of the entity being written.
    pub target: String,
    /// `None` for sends (nothing existed before).
    pub before: Option<Snapshot>,
    /// `None` for deletes (nothing exists after).
    pub applied: Option<Entity>,
}

type TargetKey = (Topic, String);

/// Runs local writes through apply/commit/rollback.
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    api: Arc<dyn ChatApi>,
    registry: TopicRegistry,
    timeout: Duration,
    session: StdMutex<Option<Session>>,
    pending: DashMap<String, PendingMutation>,
    /// Per-target FIFO locks.
    locks: DashMap<TargetKey, Arc<Mutex<()>>>,
}

/// Holds a target's lock; removes the lock entry when nobody else waits on it.
struct TargetGuard<'a> {
    locks: &'a DashMap<TargetKey, Arc<Mutex<()>>>,
    key: TargetKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means no holder and no waiter.
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        api: Arc<dyn ChatApi>,
        registry: TopicRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            api,
            registry,
            timeout,
            session: StdMutex::new(None),
            pending: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Set or clear the session whose user authors optimistic writes.
    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn user_id(&self) -> Result<String, MutationError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or(MutationError::NotAuthenticated)
    }

    /// Fail unless a session is set. For writes whose payload does not
    /// name the acting user.
    fn ensure_session(&self) -> Result<(), MutationError> {
        match *self.session.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(_) => Ok(()),
            None => Err(MutationError::NotAuthenticated),
        }
    }

    /// In-flight mutations.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.pending.iter().map(|r| r.value().clone()).collect()
    }

    /// In-flight mutations on one topic.
    pub fn pending_for(&self, topic: &Topic) -> Vec<PendingMutation> {
        self.pending
            .iter()
            .filter(|r| r.topic == *topic)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Forget in-flight bookkeeping (teardown). Their completions are
    /// discarded by the store epoch check.
    pub fn clear(&self) {
        self.pending.clear();
        self.set_session(None);
    }

    async fn lock_target(&self, topic: &Topic, id: &str) -> TargetGuard<'_> {
        let key = (topic.clone(), id.to_string());
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        TargetGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    /// Resolve a write target under its lock. Provisional messages are not
    /// addressable: their final id is only known once the send commits.
    fn ensure_target(&self, topic: &Topic, id: &str) -> Result<(), MutationError> {
        match self.store.get_entity(topic, id) {
            Some(Entity::Message(message)) if !message.is_pending() => Ok(()),
            _ => Err(MutationError::UnknownTarget { id: id.to_string() }),
        }
    }

    fn track(&self, mutation: PendingMutation) -> String {
        let temp_id = mutation.temp_id.clone();
        self.pending.insert(temp_id.clone(), mutation);
        temp_id
    }

    /// Await the server with the configured deadline.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, MutationError> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(MutationError::Rejected),
            Err(_) => Err(MutationError::TimedOut {
                after: self.timeout,
            }),
        }
    }

    /// Finish a mutation: untrack it and check that the session it started in
    /// is still current.
    fn settle(&self, temp_id: &str, epoch: u64) -> Result<(), MutationError> {
        self.pending.remove(temp_id);
        if self.store.epoch() != epoch {
            debug!(temp_id, "discarding completion from previous session");
            return Err(MutationError::Cancelled);
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Send a message.
    ///
    /// A provisional message (temporary id, author = session user, pending)
    /// appears at the end of the channel immediately and is replaced in
    /// place by the server's message on success, or removed on failure.
    /// The provisional id stays locked until then, so writes addressed to
    /// it wait and find it gone.
    #[instrument(skip_all, fields(channel_id = %channel_id))]
    pub async fn send(&self, channel_id: &str, content: &str) -> Result<Message, MutationError> {
        let author_id = self.user_id()?;
        let topic = self.registry.channel(channel_id);
        let temp_id = Uuid::new_v4().to_string();
        let _target = self.lock_target(&topic, &temp_id).await;
        let epoch = self.store.epoch();

        let provisional = Message {
            id: temp_id.clone(),
            channel_id: channel_id.to_string(),
            author_id,
            content: content.to_string(),
            created_at: Utc::now(),
            edited_at: None,
            pinned: false,
            reactions: Vec::new(),
            nonce: Some(temp_id.clone()),
            state: DeliveryState::Pending,
        };
        self.store.upsert(&topic, Entity::Message(provisional.clone()));
        self.track(PendingMutation {
            temp_id: temp_id.clone(),
            kind: MutationKind::Send,
            topic: topic.clone(),
            target: temp_id.clone(),
            before: None,
            applied: Some(Entity::Message(provisional)),
        });
        debug!(temp_id = %temp_id, "provisional message added");

        let result = self.call(self.api.send_message(channel_id, content, &temp_id)).await;
        self.settle(&temp_id, epoch)?;

        match result {
            Ok(mut message) => {
                message.state = DeliveryState::Confirmed;
                let outcome = self
                    .store
                    .replace(&topic, &temp_id, Entity::Message(message.clone()));
                info!(temp_id = %temp_id, id = %message.id, ?outcome, "message sent");
                Ok(message)
            }
            Err(e) => {
                self.store.remove(&topic, &temp_id);
                warn!(temp_id = %temp_id, error = %e, "send failed, provisional message removed");
                Err(e)
            }
        }
    }

    /// Edit a message's content.
    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, MutationError> {
        self.ensure_session()?;
        let new_content = content.to_string();
        self.modify(
            MutationKind::Edit,
            channel_id,
            message_id,
            move |m| {
                m.content = new_content;
                m.edited_at = Some(Utc::now());
            },
            |api| api.edit_message(channel_id, message_id, content),
        )
        .await
    }

    /// Delete a message.
    ///
    /// The message disappears immediately and is put back at its old
    /// position if the server refuses. A `NotFound` answer counts as
    /// success: the message is gone either way.
    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn delete(&self, channel_id: &str, message_id: &str) -> Result<(), MutationError> {
        self.ensure_session()?;
        let topic = self.registry.channel(channel_id);
        let _target = self.lock_target(&topic, message_id).await;
        let epoch = self.store.epoch();

        self.ensure_target(&topic, message_id)?;
        let Some((index, removed)) = self.store.remove(&topic, message_id) else {
            return Err(MutationError::UnknownTarget {
                id: message_id.to_string(),
            });
        };
        let temp_id = self.track(PendingMutation {
            temp_id: Uuid::new_v4().to_string(),
            kind: MutationKind::Delete,
            topic: topic.clone(),
            target: message_id.to_string(),
            before: Some(Snapshot {
                index,
                entity: removed.clone(),
            }),
            applied: None,
        });

        let result = self.call(self.api.delete_message(channel_id, message_id)).await;
        self.settle(&temp_id, epoch)?;

        match result {
            Ok(()) | Err(MutationError::Rejected(ApiError::NotFound(_))) => {
                self.store.apply_deletion(&topic, message_id);
                info!("message deleted");
                Ok(())
            }
            Err(e) => {
                let restored = self.store.restore(&topic, index, removed);
                warn!(error = %e, restored, "delete failed, rolled back");
                Err(e)
            }
        }
    }

    /// Add the session user's reaction.
    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn react(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, MutationError> {
        let user_id = self.user_id()?;
        self.modify(
            MutationKind::React,
            channel_id,
            message_id,
            |m| {
                m.add_reaction(emoji, &user_id);
            },
            |api| api.add_reaction(channel_id, message_id, emoji),
        )
        .await
    }

    /// Remove the session user's reaction.
    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn unreact(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, MutationError> {
        let user_id = self.user_id()?;
        self.modify(
            MutationKind::Unreact,
            channel_id,
            message_id,
            |m| {
                m.remove_reaction(emoji, &user_id);
            },
            |api| api.remove_reaction(channel_id, message_id, emoji),
        )
        .await
    }

    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn pin(&self, channel_id: &str, message_id: &str) -> Result<Message, MutationError> {
        self.ensure_session()?;
        self.modify(
            MutationKind::Pin,
            channel_id,
            message_id,
            |m| m.pinned = true,
            |api| api.pin_message(channel_id, message_id),
        )
        .await
    }

    #[instrument(skip_all, fields(channel_id = %channel_id, message_id = %message_id))]
    pub async fn unpin(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Message, MutationError> {
        self.ensure_session()?;
        self.modify(
            MutationKind::Unpin,
            channel_id,
            message_id,
            |m| m.pinned = false,
            |api| api.unpin_message(channel_id, message_id),
        )
        .await
    }

    /// Shared path for writes that change an existing message in place.
    async fn modify<'a, F, R, Fut>(
        &'a self,
        kind: MutationKind,
        channel_id: &str,
        message_id: &str,
        apply: F,
        request: R,
    ) -> Result<Message, MutationError>
    where
        F: FnOnce(&mut Message),
        R: FnOnce(&'a dyn ChatApi) -> Fut,
        Fut: Future<Output = Result<Message, ApiError>>,
    {
        let topic = self.registry.channel(channel_id);
        let _target = self.lock_target(&topic, message_id).await;
        let epoch = self.store.epoch();

        self.ensure_target(&topic, message_id)?;
        let index = self.store.position(&topic, message_id);
        let updated = self.store.update(&topic, message_id, |entity| {
            if let Some(message) = entity.as_message_mut() {
                apply(message);
            }
        });
        let (Some(index), Some((before, applied))) = (index, updated) else {
            return Err(MutationError::UnknownTarget {
                id: message_id.to_string(),
            });
        };

        let temp_id = self.track(PendingMutation {
            temp_id: Uuid::new_v4().to_string(),
            kind,
            topic: topic.clone(),
            target: message_id.to_string(),
            before: Some(Snapshot {
                index,
                entity: before.clone(),
            }),
            applied: Some(applied.clone()),
        });

        let result = self.call(request(self.api.as_ref())).await;
        self.settle(&temp_id, epoch)?;

        match result {
            Ok(mut message) => {
                message.state = DeliveryState::Confirmed;
                self.store.upsert(&topic, Entity::Message(message.clone()));
                debug!(kind = kind.as_str(), "mutation committed");
                Ok(message)
            }
            Err(e) => {
                let restored = self.store.restore_if_current(&topic, &applied, before);
                warn!(kind = kind.as_str(), error = %e, restored, "mutation failed, rolled back");
                Err(e)
            }
        }
    }
}
