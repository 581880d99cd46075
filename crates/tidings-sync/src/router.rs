//! Routes inbound publications into the cache.
//!
//! Each publication is decoded into a [`ServerEvent`] and merged into the
//! collection of the topic it arrived on. Every merge is idempotent, so
//! at-least-once delivery is harmless. Malformed, unknown, and misrouted
//! events are logged and dropped.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::api::ChatApi;
use crate::error::ApiError;
use crate::event::{ReactionChange, ServerEvent};
use crate::store::{CacheStore, UpsertOutcome};
use crate::topic::{Scope, Topic, TopicRegistry};
use crate::types::Entity;

/// What the router did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Cached state changed.
    Applied,
    /// Valid event that changed nothing (duplicate, unknown target, deleted id).
    Ignored,
    /// Malformed, unknown, or sent on a topic that cannot hold it.
    Dropped,
    /// The payload was not enough to update reactions; fetch them.
    RefreshReactions(ReactionRefresh),
}

/// A pending targeted reaction refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRefresh {
    pub topic: Topic,
    pub channel_id: String,
    pub message_id: String,
    /// Store epoch when the refresh was requested.
    pub epoch: u64,
}

/// Decodes publications and merges them into the [`CacheStore`].
pub struct EventRouter {
    store: Arc<CacheStore>,
    registry: TopicRegistry,
}

impl EventRouter {
    pub fn new(store: Arc<CacheStore>, registry: TopicRegistry) -> Self {
        Self { store, registry }
    }

    /// Decode a raw publication and route it.
    pub fn handle_publication(&self, topic: &Topic, payload: &str) -> Dispatch {
        match ServerEvent::decode(payload) {
            Ok(event) => self.route(topic, event),
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping publication");
                Dispatch::Dropped
            }
        }
    }

    /// Merge one decoded event into the collection for `topic`.
    pub fn route(&self, topic: &Topic, event: ServerEvent) -> Dispatch {
        let Some(scope) = self.registry.parse(topic) else {
            warn!(
                topic = %topic,
                event = event.event_type(),
                "dropping event for unknown topic"
            );
            return Dispatch::Dropped;
        };
        trace!(topic = %topic, event = event.event_type(), "routing event");

        match event {
            ServerEvent::MessageCreated(message) | ServerEvent::MessageUpdated(message) => {
                let Scope::Channel(channel_id) = &scope else {
                    return misrouted(topic, "message");
                };
                if message.channel_id != *channel_id {
                    return misrouted(topic, "message");
                }
                upserted(self.store.reconcile(topic, Entity::Message(message)))
            }
            ServerEvent::MessageDeleted(deletion) => {
                if !matches!(scope, Scope::Channel(_)) {
                    return misrouted(topic, "message");
                }
                changed(self.store.apply_deletion(topic, &deletion.id).is_some())
            }
            ServerEvent::ReactionChanged(change) => {
                let Scope::Channel(channel_id) = scope else {
                    return misrouted(topic, "reaction");
                };
                self.apply_reaction_change(topic, channel_id, change)
            }
            ServerEvent::ChannelCreated(channel) | ServerEvent::ChannelUpdated(channel) => {
                let Scope::Workspace(workspace_id) = &scope else {
                    return misrouted(topic, "channel");
                };
                if channel.workspace_id != *workspace_id {
                    return misrouted(topic, "channel");
                }
                upserted(self.store.upsert(topic, Entity::Channel(channel)))
            }
            ServerEvent::ChannelDeleted(deletion) => {
                if !matches!(scope, Scope::Workspace(_)) {
                    return misrouted(topic, "channel");
                }
                let removed = self.store.apply_deletion(topic, &deletion.id).is_some();
                self.store.evict(&self.registry.channel(&deletion.id));
                changed(removed)
            }
            ServerEvent::WorkspaceCreated(workspace) | ServerEvent::WorkspaceUpdated(workspace) => {
                if scope != Scope::App {
                    return misrouted(topic, "workspace");
                }
                upserted(self.store.upsert(topic, Entity::Workspace(workspace)))
            }
            ServerEvent::WorkspaceDeleted(deletion) => {
                if scope != Scope::App {
                    return misrouted(topic, "workspace");
                }
                let removed = self.store.apply_deletion(topic, &deletion.id).is_some();
                self.store.evict(&self.registry.workspace(&deletion.id));
                changed(removed)
            }
            ServerEvent::ChannelMemberJoined(m) => {
                if !matches!(scope, Scope::Channel(_)) {
                    return misrouted(topic, "channel membership");
                }
                changed(self.store.add_member(topic, &m.user_id))
            }
            ServerEvent::ChannelMemberLeft(m) => {
                if !matches!(scope, Scope::Channel(_)) {
                    return misrouted(topic, "channel membership");
                }
                changed(self.store.remove_member(topic, &m.user_id))
            }
            ServerEvent::WorkspaceMemberJoined(m) => {
                if !matches!(scope, Scope::Workspace(_)) {
                    return misrouted(topic, "workspace membership");
                }
                changed(self.store.add_member(topic, &m.user_id))
            }
            ServerEvent::WorkspaceMemberLeft(m) => {
                if !matches!(scope, Scope::Workspace(_)) {
                    return misrouted(topic, "workspace membership");
                }
                changed(self.store.remove_member(topic, &m.user_id))
            }
            ServerEvent::TypingStarted(t) => {
                if !matches!(scope, Scope::Channel(_)) {
                    return misrouted(topic, "typing");
                }
                self.store.start_typing(topic, &t.user_id);
                Dispatch::Applied
            }
            ServerEvent::TypingStopped(t) => {
                if !matches!(scope, Scope::Channel(_)) {
                    return misrouted(topic, "typing");
                }
                changed(self.store.stop_typing(topic, &t.user_id))
            }
        }
    }

    fn apply_reaction_change(
        &self,
        topic: &Topic,
        channel_id: String,
        change: ReactionChange,
    ) -> Dispatch {
        let ReactionChange {
            message_id,
            emoji,
            user_id,
            added,
            reactions,
        } = change;

        if let Some(reactions) = reactions {
            return changed(self.store.set_reactions(topic, &message_id, reactions));
        }

        if let (Some(emoji), Some(user_id), Some(added)) = (emoji, user_id, added) {
            let applied = self.store.update(topic, &message_id, |entity| {
                if let Some(message) = entity.as_message_mut() {
                    if added {
                        message.add_reaction(&emoji, &user_id);
                    } else {
                        message.remove_reaction(&emoji, &user_id);
                    }
                }
            });
            return changed(applied.is_some_and(|(before, after)| before != after));
        }

        if self.store.get_entity(topic, &message_id).is_none() {
            return Dispatch::Ignored;
        }
        debug!(topic = %topic, message_id = %message_id, "reaction change needs refresh");
        Dispatch::RefreshReactions(ReactionRefresh {
            topic: topic.clone(),
            channel_id,
            message_id,
            epoch: self.store.epoch(),
        })
    }

    /// Fetch the reaction summary of one message and store it.
    ///
    /// Discarded if the store was cleared since the refresh was requested.
    /// Returns whether the cache changed.
    pub async fn refresh_reactions(
        &self,
        api: &dyn ChatApi,
        refresh: &ReactionRefresh,
    ) -> Result<bool, ApiError> {
        let reactions = api
            .fetch_reactions(&refresh.channel_id, &refresh.message_id)
            .await?;
        if self.store.epoch() != refresh.epoch {
            debug!(
                message_id = %refresh.message_id,
                "discarding reaction refresh from previous session"
            );
            return Ok(false);
        }
        Ok(self
            .store
            .set_reactions(&refresh.topic, &refresh.message_id, reactions))
    }
}

fn upserted(outcome: UpsertOutcome) -> Dispatch {
    match outcome {
        UpsertOutcome::Inserted(_) | UpsertOutcome::Updated(_) => Dispatch::Applied,
        UpsertOutcome::Unchanged | UpsertOutcome::Tombstoned => Dispatch::Ignored,
    }
}

fn changed(changed: bool) -> Dispatch {
    if changed { Dispatch::Applied } else { Dispatch::Ignored }
}

fn misrouted(topic: &Topic, family: &str) -> Dispatch {
    warn!(topic = %topic, family, "dropping event sent on the wrong topic");
    Dispatch::Dropped
}
