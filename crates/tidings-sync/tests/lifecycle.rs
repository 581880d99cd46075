//! Session lifecycle: reconnects, teardown, history, and server-driven
//! refreshes, driven end to end through the in-memory transport.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    ScriptedApi, USER, at, config, engine, eventually, flush, ids, message, started, wait_connected,
};
use tidings_sync::event::{Deletion, ReactionChange};
use tidings_sync::{
    CacheUpdate, Channel, ConnectionState, Credential, Entity, HttpChatApi, MemoryTransport,
    MutationError, Reaction, Scope, ServerEvent, Session, SyncEngine,
};

#[tokio::test]
async fn test_reconnect_resubscribes_each_topic_once() {
    let api = Arc::new(ScriptedApi::new());
    let (engine, transport) = engine(api);
    engine.start(Session::new(USER, "token")).await;

    let _a = engine.subscribe(&Scope::channel("a"));
    let _b = engine.subscribe(&Scope::channel("b"));
    let _b_again = engine.subscribe(&Scope::channel("b"));
    wait_connected(&engine).await;
    eventually("both topics subscribed", || {
        transport.subscribed().len() == 2
    })
    .await;

    let a = engine.registry().channel("a");
    let b = engine.registry().channel("b");
    assert_eq!(transport.subscribe_count(&b), 1);
    transport.clear_ops();

    transport.drop_connection();
    eventually("reconnected", || {
        transport.connect_count() == 2 && transport.subscribed().len() == 2
    })
    .await;

    assert_eq!(transport.subscribe_count(&a), 1);
    assert_eq!(transport.subscribe_count(&b), 1);
    assert_eq!(transport.unsubscribe_count(&a), 0);
    assert_eq!(transport.unsubscribe_count(&b), 0);
    assert_eq!(transport.ops().len(), 2);

    engine.stop().await;
}

#[tokio::test]
async fn test_events_after_reconnect_are_applied() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;

    fixture.transport.drop_connection();
    eventually("reconnected", || {
        fixture.transport.connect_count() == 2
            && fixture.transport.subscribed().contains(&fixture.topic)
    })
    .await;

    let event = ServerEvent::MessageCreated(message("m1", "c1", "after"));
    assert!(fixture.transport.publish(&fixture.topic, &event));
    eventually("message routed", || {
        fixture.engine.store().len(&fixture.topic) == 1
    })
    .await;

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_stop_tears_everything_down() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;
    let topic = fixture.topic.clone();
    fixture
        .engine
        .store()
        .upsert(&topic, Entity::Message(message("m1", "c1", "m1")));

    fixture.engine.stop().await;

    assert_eq!(fixture.transport.unsubscribe_count(&topic), 1);
    assert!(!fixture.transport.is_connected());
    assert!(fixture.engine.store().topics().is_empty());
    assert!(fixture.engine.subscriptions().topics().is_empty());
    assert_eq!(fixture.engine.state(), ConnectionState::Disconnected);
    assert!(fixture.engine.session().is_none());

    // Handles from the ended session are inert.
    fixture.transport.clear_ops();
    drop(fixture.subscription);
    assert!(fixture.transport.ops().is_empty());

    // Nothing reaches the cache any more.
    let event = ServerEvent::MessageCreated(message("m2", "c1", "m2"));
    assert!(!fixture.transport.publish(&topic, &event));
    assert!(fixture.engine.store().is_empty(&topic));
}

#[tokio::test]
async fn test_restart_starts_clean() {
    let api = Arc::new(ScriptedApi::new());
    let (engine, transport) = engine(api);

    engine.start(Session::new(USER, "token")).await;
    let first = engine.subscribe(&Scope::channel("c1"));
    wait_connected(&engine).await;
    engine.stop().await;
    drop(first);

    engine.start(Session::new("bob", "token-2")).await;
    let _second = engine.subscribe(&Scope::channel("c1"));
    wait_connected(&engine).await;
    let topic = engine.registry().channel("c1");
    eventually("resubscribed", || transport.subscribed().contains(&topic)).await;

    assert_eq!(engine.subscriptions().ref_count(&topic), 1);
    assert_eq!(engine.session().map(|s| s.user_id), Some("bob".to_string()));

    engine.stop().await;
}

#[tokio::test]
async fn test_mutation_completing_after_stop_is_discarded() {
    let api = Arc::new(ScriptedApi::gated());
    let fixture = started(&api, "c1").await;

    let mutations = Arc::clone(fixture.engine.mutations());
    let send = tokio::spawn(async move { mutations.send("c1", "late").await });
    eventually("send in flight", || {
        fixture.engine.mutations().pending().len() == 1
    })
    .await;

    fixture.engine.stop().await;
    api.release(1);

    assert!(matches!(send.await.unwrap(), Err(MutationError::Cancelled)));
    assert!(fixture.engine.store().is_empty(&fixture.topic));
    assert!(fixture.engine.mutations().pending().is_empty());
}

#[tokio::test]
async fn test_mutations_require_session() {
    let api = Arc::new(ScriptedApi::new());
    let (engine, _transport) = engine(Arc::clone(&api));

    let result = engine.mutations().send("c1", "hi").await;

    assert!(matches!(result, Err(MutationError::NotAuthenticated)));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_connect_rejected_with_empty_token_fails() {
    let api = Arc::new(ScriptedApi::new());
    let transport = Arc::new(MemoryTransport::new());
    let config = config().with_reconnect(tidings_sync::ReconnectConfig {
        max_attempts: 2,
        initial_delay: std::time::Duration::from_millis(5),
        max_delay: std::time::Duration::from_millis(5),
        backoff_multiplier: 1.0,
    });
    let engine = SyncEngine::new(config, transport.clone(), api).unwrap();

    engine.start(Session::new(USER, "")).await;
    let mut state = engine.connection_state();
    state
        .wait_for(|s| matches!(s, ConnectionState::Failed { .. }))
        .await
        .unwrap();

    assert!(!transport.is_connected());
    engine.stop().await;
}

#[tokio::test]
async fn test_load_history_merges_with_live_messages() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;

    let mut live = message("m2", "c1", "edited live");
    live.created_at = at(2);
    assert!(
        fixture
            .transport
            .publish(&fixture.topic, &ServerEvent::MessageCreated(live))
    );
    flush(&fixture.engine, &fixture.transport, &fixture.topic).await;

    let mut older = message("m1", "c1", "m1");
    older.created_at = at(1);
    let mut stale = message("m2", "c1", "original");
    stale.created_at = at(2);
    api.set_history(vec![older, stale]);

    let added = fixture.engine.load_history("c1").await.unwrap();

    assert_eq!(added, 1);
    assert_eq!(
        ids(fixture.engine.store(), &fixture.topic),
        vec!["m1", "m2"]
    );
    assert_eq!(
        fixture.engine.store().messages(&fixture.topic)[1].content,
        "edited live"
    );
    assert!(fixture.engine.store().is_loaded(&fixture.topic));

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_incomplete_reaction_event_triggers_refresh() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;
    fixture
        .engine
        .store()
        .upsert(&fixture.topic, Entity::Message(message("m1", "c1", "m1")));

    let summary = vec![Reaction {
        emoji: "+1".to_string(),
        users: BTreeSet::from(["bob".to_string(), "carol".to_string()]),
    }];
    api.set_reactions(summary.clone());

    let change = ServerEvent::ReactionChanged(ReactionChange {
        message_id: "m1".to_string(),
        emoji: Some("+1".to_string()),
        user_id: None,
        added: None,
        reactions: None,
    });
    assert!(fixture.transport.publish(&fixture.topic, &change));
    eventually("reactions refreshed", || {
        fixture.engine.store().messages(&fixture.topic)[0].reactions == summary
    })
    .await;

    assert!(api.calls().contains(&"reactions m1".to_string()));

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_channel_delete_evicts_channel_cache() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;
    let _workspace = fixture.engine.subscribe(&Scope::workspace("w1"));
    let workspace = fixture.engine.registry().workspace("w1");
    eventually("workspace subscribed", || {
        fixture.transport.subscribed().contains(&workspace)
    })
    .await;

    let channel = Channel {
        id: "c1".to_string(),
        workspace_id: "w1".to_string(),
        name: "general".to_string(),
        description: None,
        archived: false,
        created_at: Utc::now(),
    };
    assert!(
        fixture
            .transport
            .publish(&workspace, &ServerEvent::ChannelCreated(channel))
    );
    let event = ServerEvent::MessageCreated(message("m1", "c1", "m1"));
    assert!(fixture.transport.publish(&fixture.topic, &event));
    eventually("channel and message cached", || {
        fixture.engine.store().len(&workspace) == 1
            && fixture.engine.store().len(&fixture.topic) == 1
    })
    .await;

    let deletion = ServerEvent::ChannelDeleted(Deletion {
        id: "c1".to_string(),
    });
    assert!(fixture.transport.publish(&workspace, &deletion));
    eventually("channel removed", || {
        fixture.engine.store().is_empty(&workspace)
    })
    .await;

    assert!(fixture.engine.store().is_empty(&fixture.topic));

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_last_release_evicts_topic_cache() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;
    let topic = fixture.topic.clone();
    let second = fixture.engine.subscribe(&Scope::channel("c1"));

    let created = ServerEvent::MessageCreated(message("m1", "c1", "m1"));
    assert!(fixture.transport.publish(&topic, &created));
    flush(&fixture.engine, &fixture.transport, &topic).await;
    assert_eq!(ids(fixture.engine.store(), &topic), vec!["m1"]);

    drop(fixture.subscription);
    assert_eq!(ids(fixture.engine.store(), &topic), vec!["m1"]);

    drop(second);
    assert!(!fixture.engine.store().topics().contains(&topic));
    assert_eq!(fixture.transport.unsubscribe_count(&topic), 1);

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_misrouted_and_malformed_events_are_dropped() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;

    let wrong_channel = ServerEvent::MessageCreated(message("m1", "c2", "wrong channel"));
    assert!(fixture.transport.publish(&fixture.topic, &wrong_channel));
    assert!(fixture.transport.publish_raw(&fixture.topic, "not json"));
    let payload = r#"{"type":"message.exploded","payload":{}}"#;
    assert!(fixture.transport.publish_raw(&fixture.topic, payload));
    flush(&fixture.engine, &fixture.transport, &fixture.topic).await;

    assert!(fixture.engine.store().is_empty(&fixture.topic));
    assert!(fixture.engine.state().is_connected());

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_topic_watch_sees_pushed_changes() {
    let api = Arc::new(ScriptedApi::new());
    let fixture = started(&api, "c1").await;
    let mut watch = fixture.engine.store().watch(&fixture.topic);

    let event = ServerEvent::MessageCreated(message("m1", "c1", "m1"));
    assert!(fixture.transport.publish(&fixture.topic, &event));
    let update = tokio::time::timeout(std::time::Duration::from_secs(2), watch.recv())
        .await
        .unwrap();

    assert_eq!(
        update,
        Some(CacheUpdate::Inserted {
            topic: fixture.topic.clone(),
            id: "m1".to_string(),
            index: 0,
        })
    );

    fixture.engine.stop().await;
}

#[tokio::test]
async fn test_send_over_http_api() {
    let server = MockServer::start().await;
    let body = serde_json::to_value(message("m42", "c1", "hello")).unwrap();
    Mock::given(method("POST"))
        .and(path("/api/channels/c1/messages"))
        .respond_with(ResponseTemplate::new(201).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let api = HttpChatApi::new(&server.uri(), Credential::new("token")).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let engine = SyncEngine::new(config(), transport, Arc::new(api)).unwrap();
    engine.start(Session::new(USER, "token")).await;

    let sent = engine.mutations().send("c1", "hello").await.unwrap();

    assert_eq!(sent.id, "m42");
    let topic = engine.registry().channel("c1");
    assert_eq!(ids(engine.store(), &topic), vec!["m42"]);

    engine.stop().await;
}
