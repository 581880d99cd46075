//! Cached chat entities and session types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a cached message is confirmed by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// Written optimistically, awaiting the server.
    Pending,
    /// Authoritative server state.
    #[default]
    Confirmed,
}

/// One emoji's reactions on a message.
///
/// Tracks who reacted rather than a bare count, so applying the same
/// reaction delta twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    #[serde(default)]
    pub users: BTreeSet<String>,
}

impl Reaction {
    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn reacted_by(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Client-generated id echoed back by the server for sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Local-only delivery marker, never sent by the server.
    #[serde(skip)]
    pub state: DeliveryState,
}

impl Message {
    /// Add `user_id` to the reaction for `emoji`.
    ///
    /// Returns false if the user had already reacted.
    pub fn add_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        match self.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => reaction.users.insert(user_id.to_string()),
            None => {
                self.reactions.push(Reaction {
                    emoji: emoji.to_string(),
                    users: BTreeSet::from([user_id.to_string()]),
                });
                true
            }
        }
    }

    /// Remove `user_id` from the reaction for `emoji`, dropping empty reactions.
    ///
    /// Returns false if the user had not reacted.
    pub fn remove_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        let Some(pos) = self.reactions.iter().position(|r| r.emoji == emoji) else {
            return false;
        };
        let removed = self.reactions[pos].users.remove(user_id);
        if self.reactions[pos].users.is_empty() {
            self.reactions.remove(pos);
        }
        removed
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}

/// A channel inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// A workspace (a group of channels).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Any entity held in a cached collection.
///
/// Channel topics hold messages, workspace topics hold channels and the
/// app topic holds workspaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Message(Message),
    Channel(Channel),
    Workspace(Workspace),
}

impl Entity {
    /// Stable id (or temporary id for a provisional message).
    pub fn id(&self) -> &str {
        match self {
            Entity::Message(m) => &m.id,
            Entity::Channel(c) => &c.id,
            Entity::Workspace(w) => &w.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Message(m) => m.created_at,
            Entity::Channel(c) => c.created_at,
            Entity::Workspace(w) => w.created_at,
        }
    }

    /// Client nonce, only ever present on messages.
    pub fn nonce(&self) -> Option<&str> {
        match self {
            Entity::Message(m) => m.nonce.as_deref(),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Entity::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_message_mut(&mut self) -> Option<&mut Message> {
        match self {
            Entity::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Entity::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_workspace(&self) -> Option<&Workspace> {
        match self {
            Entity::Workspace(w) => Some(w),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Message(_) => "message",
            Entity::Channel(_) => "channel",
            Entity::Workspace(_) => "workspace",
        }
    }
}

impl From<Message> for Entity {
    fn from(m: Message) -> Self {
        Entity::Message(m)
    }
}

impl From<Channel> for Entity {
    fn from(c: Channel) -> Self {
        Entity::Channel(c)
    }
}

impl From<Workspace> for Entity {
    fn from(w: Workspace) -> Self {
        Entity::Workspace(w)
    }
}

/// Opaque bearer credential used to authenticate the transport and REST calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// An authenticated user session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub credential: Credential,
}

impl Session {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: Credential::new(token),
        }
    }
}
