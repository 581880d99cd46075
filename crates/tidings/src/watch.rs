//! Follow scopes and log what changes in the cache.

use miette::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tidings_sync::{CacheStore, CacheUpdate, Entity, Scope, Session, SyncEngine};

pub async fn run(
    engine: &SyncEngine,
    session: Session,
    channels: &[String],
    workspaces: &[String],
    load_history: bool,
) -> Result<()> {
    let mut updates = engine.store().subscribe();
    engine.start(session).await;

    let mut handles = vec![engine.subscribe(&Scope::App)];
    handles.extend(workspaces.iter().map(|id| engine.subscribe(&Scope::workspace(id))));
    handles.extend(channels.iter().map(|id| engine.subscribe(&Scope::channel(id))));
    info!(topics = handles.len(), "watching");

    if load_history {
        for channel_id in channels {
            match engine.load_history(channel_id).await {
                Ok(added) => info!(channel_id = %channel_id, added, "history loaded"),
                Err(e) => warn!(channel_id = %channel_id, error = %e, "failed to load history"),
            }
        }
    }

    let mut state = engine.connection_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                info!(state = ?current, "connection state changed");
            }
            update = updates.recv() => match update {
                Ok(update) => log_update(engine.store(), &update),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "update stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(handles);
    engine.stop().await;
    Ok(())
}

fn log_update(store: &CacheStore, update: &CacheUpdate) {
    match update {
        CacheUpdate::Inserted { topic, id, .. } | CacheUpdate::Updated { topic, id } => {
            match store.get_entity(topic, id) {
                Some(Entity::Message(m)) => info!(
                    topic = %topic,
                    id = %m.id,
                    author = %m.author_id,
                    pending = m.is_pending(),
                    "{}",
                    m.content
                ),
                Some(Entity::Channel(c)) => {
                    info!(topic = %topic, id = %c.id, name = %c.name, "channel")
                }
                Some(Entity::Workspace(w)) => {
                    info!(topic = %topic, id = %w.id, name = %w.name, "workspace")
                }
                None => {}
            }
        }
        CacheUpdate::Replaced { topic, temp_id, id } => {
            info!(topic = %topic, temp_id = %temp_id, id = %id, "confirmed")
        }
        CacheUpdate::Removed { topic, id } => info!(topic = %topic, id = %id, "removed"),
        CacheUpdate::MembersChanged { topic } => {
            info!(topic = %topic, members = store.members(topic).len(), "members changed")
        }
        CacheUpdate::TypingChanged { topic } => {
            let typing: Vec<String> = store.typing(topic).into_iter().collect();
            info!(topic = %topic, typing = ?typing, "typing")
        }
        CacheUpdate::Reloaded { topic } => {
            info!(topic = %topic, entries = store.len(topic), "reloaded")
        }
        CacheUpdate::Cleared => info!("cache cleared"),
    }
}
