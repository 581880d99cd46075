//! The REST seam.
//!
//! One async call per mutation kind, each returning the authoritative
//! entity or an [`ApiError`]. The engine never retries these calls itself.

use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::{Message, Reaction};

/// Authoritative chat operations on the server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post a message. `nonce` is echoed back on the pushed `message.created`.
    async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ApiError>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, ApiError>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ApiError>;

    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, ApiError>;

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, ApiError>;

    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError>;

    async fn unpin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError>;

    /// Current reaction summary of one message.
    async fn fetch_reactions(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Vec<Reaction>, ApiError>;

    /// Recent history of a channel, oldest first.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError>;
}
