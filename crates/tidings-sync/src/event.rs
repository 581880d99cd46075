//! Inbound publication events.
//!
//! Every publication is a JSON object `{ "type": "<family>.<kind>", "payload": {...} }`.
//! The set of types is closed: anything else decodes to
//! [`EventError::UnknownType`] and is dropped by the router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventError;
use crate::types::{Channel, Message, Reaction, Workspace};

/// Payload of a `*.deleted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    pub id: String,
}

/// Payload of `message.reaction_changed`.
///
/// Servers send either a full summary (`reactions`) or a single delta
/// (`user_id`, `emoji`, `added`). When neither is complete the router
/// refreshes the message's reactions over REST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChange {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
}

/// Payload of `*.member_joined` / `*.member_left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: String,
}

/// Payload of `channel.typing_start` / `channel.typing_stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub user_id: String,
}

/// A decoded publication.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    MessageCreated(Message),
    MessageUpdated(Message),
    MessageDeleted(Deletion),
    ReactionChanged(ReactionChange),
    ChannelCreated(Channel),
    ChannelUpdated(Channel),
    ChannelDeleted(Deletion),
    ChannelMemberJoined(Membership),
    ChannelMemberLeft(Membership),
    TypingStarted(Typing),
    TypingStopped(Typing),
    WorkspaceCreated(Workspace),
    WorkspaceUpdated(Workspace),
    WorkspaceDeleted(Deletion),
    WorkspaceMemberJoined(Membership),
    WorkspaceMemberLeft(Membership),
}

/// Envelope before the payload is interpreted.
#[derive(Debug, Serialize, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ServerEvent {
    /// Decode a publication from its JSON text.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_str(text)?;
        Self::from_parts(&raw.kind, raw.payload)
    }

    /// Decode from an already-parsed `{type, payload}` value.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_value(value)?;
        Self::from_parts(&raw.kind, raw.payload)
    }

    fn from_parts(kind: &str, payload: Value) -> Result<Self, EventError> {
        use serde_json::from_value as p;

        let event = match kind {
            "message.created" => ServerEvent::MessageCreated(p(payload)?),
            "message.updated" => ServerEvent::MessageUpdated(p(payload)?),
            "message.deleted" => ServerEvent::MessageDeleted(p(payload)?),
            "message.reaction_changed" => ServerEvent::ReactionChanged(p(payload)?),
            "channel.created" => ServerEvent::ChannelCreated(p(payload)?),
            "channel.updated" => ServerEvent::ChannelUpdated(p(payload)?),
            "channel.deleted" => ServerEvent::ChannelDeleted(p(payload)?),
            "channel.member_joined" => ServerEvent::ChannelMemberJoined(p(payload)?),
            "channel.member_left" => ServerEvent::ChannelMemberLeft(p(payload)?),
            "channel.typing_start" => ServerEvent::TypingStarted(p(payload)?),
            "channel.typing_stop" => ServerEvent::TypingStopped(p(payload)?),
            "workspace.created" => ServerEvent::WorkspaceCreated(p(payload)?),
            "workspace.updated" => ServerEvent::WorkspaceUpdated(p(payload)?),
            "workspace.deleted" => ServerEvent::WorkspaceDeleted(p(payload)?),
            "workspace.member_joined" => ServerEvent::WorkspaceMemberJoined(p(payload)?),
            "workspace.member_left" => ServerEvent::WorkspaceMemberLeft(p(payload)?),
            other => return Err(EventError::UnknownType(other.to_string())),
        };
        Ok(event)
    }

    /// The wire `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::MessageCreated(_) => "message.created",
            ServerEvent::MessageUpdated(_) => "message.updated",
            ServerEvent::MessageDeleted(_) => "message.deleted",
            ServerEvent::ReactionChanged(_) => "message.reaction_changed",
            ServerEvent::ChannelCreated(_) => "channel.created",
            ServerEvent::ChannelUpdated(_) => "channel.updated",
            ServerEvent::ChannelDeleted(_) => "channel.deleted",
            ServerEvent::ChannelMemberJoined(_) => "channel.member_joined",
            ServerEvent::ChannelMemberLeft(_) => "channel.member_left",
            ServerEvent::TypingStarted(_) => "channel.typing_start",
            ServerEvent::TypingStopped(_) => "channel.typing_stop",
            ServerEvent::WorkspaceCreated(_) => "workspace.created",
            ServerEvent::WorkspaceUpdated(_) => "workspace.updated",
            ServerEvent::WorkspaceDeleted(_) => "workspace.deleted",
            ServerEvent::WorkspaceMemberJoined(_) => "workspace.member_joined",
            ServerEvent::WorkspaceMemberLeft(_) => "workspace.member_left",
        }
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value()?)
    }

    /// Encode to a `{type, payload}` JSON value.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        use serde_json::to_value as v;

        let payload = match self {
            ServerEvent::MessageCreated(m) | ServerEvent::MessageUpdated(m) => v(m)?,
            ServerEvent::ReactionChanged(r) => v(r)?,
            ServerEvent::ChannelCreated(c) | ServerEvent::ChannelUpdated(c) => v(c)?,
            ServerEvent::WorkspaceCreated(w) | ServerEvent::WorkspaceUpdated(w) => v(w)?,
            ServerEvent::MessageDeleted(d)
            | ServerEvent::ChannelDeleted(d)
            | ServerEvent::WorkspaceDeleted(d) => v(d)?,
            ServerEvent::ChannelMemberJoined(m)
            | ServerEvent::ChannelMemberLeft(m)
            | ServerEvent::WorkspaceMemberJoined(m)
            | ServerEvent::WorkspaceMemberLeft(m) => v(m)?,
            ServerEvent::TypingStarted(t) | ServerEvent::TypingStopped(t) => v(t)?,
        };
        v(RawEvent {
            kind: self.event_type().to_string(),
            payload,
        })
    }
}
