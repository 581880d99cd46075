//! Real-time cache synchronization for Tidings chat clients.
//!
//! Keeps a local cache of workspaces, channels, and messages consistent
//! with the server while local writes are applied optimistically and
//! server changes arrive as push events over a pub/sub connection.
//!
//! ## Components
//!
//! - **Topic Registry**: maps app, workspace, and channel scopes to transport topics
//! - **Subscription Manager**: reference-counted, idempotent topic subscriptions
//! - **Connection Lifecycle**: authenticated connection with reconnect and resubscribe
//! - **Event Router**: merges inbound events into the cache, idempotently
//! - **Mutation Coordinator**: optimistic apply, commit, and rollback of local writes
//! - **Cache Store**: the single place cached state changes

mod api;
mod client;
mod config;
mod connection;
mod engine;
mod error;
pub mod event;
mod memory;
pub mod mutation;
pub mod router;
pub mod store;
mod subscriptions;
mod topic;
mod transport;
mod types;
mod ws;

pub use api::ChatApi;
pub use client::HttpChatApi;
pub use config::{DEFAULT_API_URL, DEFAULT_APP_ID, DEFAULT_WS_URL, ReconnectConfig, SyncConfig};
pub use connection::ConnectionState;
pub use engine::{HISTORY_PAGE_SIZE, SyncEngine};
pub use error::{ApiError, ConfigError, EventError, MutationError, SyncError, TransportError};
pub use event::ServerEvent;
pub use memory::{MemoryTransport, SubscriptionOp};
pub use mutation::{MutationCoordinator, MutationKind, PendingMutation, Snapshot};
pub use router::{Dispatch, EventRouter, ReactionRefresh};
pub use store::{CacheStore, CacheUpdate, ReplaceOutcome, TopicWatch, UpsertOutcome};
pub use subscriptions::{SubscriptionHandle, SubscriptionManager};
pub use topic::{Scope, Topic, TopicRegistry};
pub use transport::{Publications, Transport, TransportEvent};
pub use types::*;
pub use ws::{DEFAULT_READ_TIMEOUT, WsTransport};
