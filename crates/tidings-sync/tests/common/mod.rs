//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;

use tidings_sync::event::Typing;
use tidings_sync::{
    ApiError, CacheStore, ChatApi, ConnectionState, DeliveryState, MemoryTransport, Message,
    Reaction, ReconnectConfig, Scope, ServerEvent, Session, SubscriptionHandle, SyncConfig,
    SyncEngine, Topic,
};

pub const APP: &str = "app";
pub const USER: &str = "alice";

/// A [`ChatApi`] whose answers are scripted by the test.
///
/// Sends are assigned ids `m42`, `m43`, ... and echo the nonce. Calls can
/// be held at a gate until the test releases them, and failures can be
/// queued.
pub struct ScriptedApi {
    next_id: AtomicU64,
    gate: Option<Semaphore>,
    failures: Mutex<VecDeque<ApiError>>,
    history: Mutex<Vec<Message>>,
    reactions: Mutex<Vec<Reaction>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(42),
            gate: None,
            failures: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call waits for [`ScriptedApi::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    /// Let `n` held calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// The next call fails with `error`.
    pub fn fail_next(&self, error: ApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_history(&self, messages: Vec<Message>) {
        *self.history.lock().unwrap() = messages;
    }

    pub fn set_reactions(&self, reactions: Vec<Reaction>) {
        *self.reactions.lock().unwrap() = reactions;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ApiError> {
        self.enter(format!("send {channel_id}")).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut m = message(&format!("m{id}"), channel_id, content);
        m.nonce = Some(nonce.to_string());
        Ok(m)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, ApiError> {
        self.enter(format!("edit {message_id}")).await?;
        let mut m = message(message_id, channel_id, content);
        m.edited_at = Some(Utc::now());
        Ok(m)
    }

    async fn delete_message(&self, _channel_id: &str, message_id: &str) -> Result<(), ApiError> {
        self.enter(format!("delete {message_id}")).await
    }

    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        self.enter(format!("react {message_id}")).await?;
        let mut m = message(message_id, channel_id, message_id);
        m.add_reaction(emoji, USER);
        Ok(m)
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        _emoji: &str,
    ) -> Result<Message, ApiError> {
        self.enter(format!("unreact {message_id}")).await?;
        Ok(message(message_id, channel_id, message_id))
    }

    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError> {
        self.enter(format!("pin {message_id}")).await?;
        let mut m = message(message_id, channel_id, message_id);
        m.pinned = true;
        Ok(m)
    }

    async fn unpin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError> {
        self.enter(format!("unpin {message_id}")).await?;
        Ok(message(message_id, channel_id, message_id))
    }

    async fn fetch_reactions(
        &self,
        _channel_id: &str,
        message_id: &str,
    ) -> Result<Vec<Reaction>, ApiError> {
        self.enter(format!("reactions {message_id}")).await?;
        Ok(self.reactions.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        _limit: usize,
    ) -> Result<Vec<Message>, ApiError> {
        self.enter(format!("history {channel_id}")).await?;
        Ok(self.history.lock().unwrap().clone())
    }
}

/// Fixed timestamp `minute` minutes after a base instant.
pub fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute)
}

/// A confirmed message whose content equals its id unless given.
pub fn message(id: &str, channel_id: &str, content: &str) -> Message {
    Message {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        author_id: USER.to_string(),
        content: content.to_string(),
        created_at: at(0),
        edited_at: None,
        pinned: false,
        reactions: Vec::new(),
        nonce: None,
        state: DeliveryState::Confirmed,
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::new(APP)
        .with_mutation_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        })
}

pub fn engine(api: Arc<ScriptedApi>) -> (SyncEngine, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let engine = SyncEngine::new(config(), transport.clone(), api).unwrap();
    (engine, transport)
}

/// Wait until `condition` holds, polling briefly.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_connected(engine: &SyncEngine) {
    let mut state = engine.connection_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(ConnectionState::is_connected),
    )
    .await
    .expect("connection timed out")
    .unwrap();
}

pub struct Fixture {
    pub engine: Arc<SyncEngine>,
    pub transport: Arc<MemoryTransport>,
    pub topic: Topic,
    pub subscription: SubscriptionHandle,
}

/// Start an engine with one channel subscribed and wait until it is live.
pub async fn started(api: &Arc<ScriptedApi>, channel_id: &str) -> Fixture {
    let (engine, transport) = engine(Arc::clone(api));
    let engine = Arc::new(engine);
    engine.start(Session::new(USER, "token")).await;
    let topic = engine.registry().channel(channel_id);
    let subscription = engine.subscribe(&Scope::channel(channel_id));
    wait_connected(&engine).await;
    eventually("channel subscribed", || {
        transport.subscribed().contains(&topic)
    })
    .await;
    Fixture {
        engine,
        transport,
        topic,
        subscription,
    }
}

/// Publish a marker and wait for it so that everything published before
/// it has been routed.
pub async fn flush(engine: &SyncEngine, transport: &MemoryTransport, topic: &Topic) {
    let marker = ServerEvent::TypingStarted(Typing {
        user_id: "flush".to_string(),
    });
    assert!(transport.publish(topic, &marker));
    eventually("flush marker", || {
        engine.store().typing(topic).contains("flush")
    })
    .await;
}

pub fn ids(store: &CacheStore, topic: &Topic) -> Vec<String> {
    store
        .get(topic)
        .iter()
        .map(|e| e.id().to_string())
        .collect()
}
