//! Mapping from logical resources to transport topics.
//!
//! Topic naming:
//! - app-wide: `<app-id>`
//! - workspace: `workspace:<app-id>:<workspace-id>`
//! - channel: `channel:<app-id>:<channel-id>`
//!
//! The app topic never contains `:` (enforced by config validation), so it
//! cannot collide with a prefixed topic.

use std::fmt;

use serde::{Deserialize, Serialize};

const WORKSPACE_PREFIX: &str = "workspace";
const CHANNEL_PREFIX: &str = "channel";

/// A logical resource that has its own pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// App-wide events (workspace list changes).
    App,
    /// One workspace (its channel list and members).
    Workspace(String),
    /// One channel (its messages, members, typing).
    Channel(String),
}

impl Scope {
    /// Shorthand for a channel scope.
    pub fn channel(id: impl Into<String>) -> Self {
        Scope::Channel(id.into())
    }

    /// Shorthand for a workspace scope.
    pub fn workspace(id: impl Into<String>) -> Self {
        Scope::Workspace(id.into())
    }
}

/// An opaque pub/sub topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Wrap a raw topic string received from the transport.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Formats topics for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRegistry {
    app_id: String,
}

impl TopicRegistry {
    /// Create a registry for the given app id.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The topic for a scope. Deterministic and collision-free across kinds.
    pub fn topic_for(&self, scope: &Scope) -> Topic {
        match scope {
            Scope::App => Topic(self.app_id.clone()),
            Scope::Workspace(id) => Topic(format!("{}:{}:{}", WORKSPACE_PREFIX, self.app_id, id)),
            Scope::Channel(id) => Topic(format!("{}:{}:{}", CHANNEL_PREFIX, self.app_id, id)),
        }
    }

    /// Topic for a channel id.
    pub fn channel(&self, channel_id: &str) -> Topic {
        self.topic_for(&Scope::Channel(channel_id.to_string()))
    }

    /// Topic for a workspace id.
    pub fn workspace(&self, workspace_id: &str) -> Topic {
        self.topic_for(&Scope::Workspace(workspace_id.to_string()))
    }

    /// Recover the scope of a topic produced by this registry.
    ///
    /// Returns `None` for topics belonging to another app or with an
    /// unrecognized prefix.
    pub fn parse(&self, topic: &Topic) -> Option<Scope> {
        let raw = topic.as_str();
        if raw == self.app_id {
            return Some(Scope::App);
        }

        let (kind, rest) = raw.split_once(':')?;
        let id = rest.strip_prefix(self.app_id.as_str())?.strip_prefix(':')?;
        if id.is_empty() {
            return None;
        }

        match kind {
            WORKSPACE_PREFIX => Some(Scope::Workspace(id.to_string())),
            CHANNEL_PREFIX => Some(Scope::Channel(id.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_format() {
        let registry = TopicRegistry::new("tidings");
        assert_eq!(registry.topic_for(&Scope::App).as_str(), "tidings");
        assert_eq!(
            registry.topic_for(&Scope::workspace("w1")).as_str(),
            "workspace:tidings:w1"
        );
        assert_eq!(
            registry.topic_for(&Scope::channel("c1")).as_str(),
            "channel:tidings:c1"
        );
    }

    #[test]
    fn test_topic_deterministic() {
        let registry = TopicRegistry::new("app");
        assert_eq!(registry.channel("c1"), registry.channel("c1"));
        assert_eq!(
            registry.channel("c1"),
            registry.topic_for(&Scope::channel("c1"))
        );
    }

    #[test]
    fn test_same_id_different_kinds_do_not_collide() {
        let registry = TopicRegistry::new("app");
        assert_ne!(registry.channel("x"), registry.workspace("x"));
        assert_ne!(registry.channel("app"), registry.topic_for(&Scope::App));
    }

    #[test]
    fn test_parse_roundtrip() {
        let registry = TopicRegistry::new("app");
        for scope in [Scope::App, Scope::workspace("w9"), Scope::channel("c:with:colons")] {
            let topic = registry.topic_for(&scope);
            assert_eq!(registry.parse(&topic), Some(scope));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        let registry = TopicRegistry::new("app");
        assert_eq!(registry.parse(&Topic::from_raw("other")), None);
        assert_eq!(registry.parse(&Topic::from_raw("channel:other:c1")), None);
        assert_eq!(registry.parse(&Topic::from_raw("dm:app:c1")), None);
        assert_eq!(registry.parse(&Topic::from_raw("channel:app:")), None);
    }
}
