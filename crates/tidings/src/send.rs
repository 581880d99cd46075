//! One-shot message send.

use miette::Result;
use tracing::info;

use tidings_sync::{Session, SyncEngine};

pub async fn run(
    engine: &SyncEngine,
    session: Session,
    channel_id: &str,
    text: &str,
) -> Result<()> {
    engine.start(session).await;

    let result = engine.mutations().send(channel_id, text).await;
    engine.stop().await;

    let message = result.map_err(|e| miette::miette!("send failed: {}", e))?;
    info!(id = %message.id, channel_id, "message sent");
    println!("{}", message.id);
    Ok(())
}
