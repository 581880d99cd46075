//! WebSocket pub/sub transport.
//!
//! Frames are JSON text messages:
//! - client to server: `{"op": "subscribe" | "unsubscribe", "topic": "..."}`
//! - server to client: `{"topic": "...", "data": {"type": "...", "payload": {...}}}`
//!
//! The bearer credential goes in the `Authorization` header of the upgrade
//! request. Each connection runs a reader task and a writer task; the
//! reader reports the end of the connection as [`TransportEvent::Closed`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::topic::Topic;
use crate::transport::{Publications, Transport, TransportEvent};
use crate::types::Credential;

/// Silence allowed before the connection is considered dead.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Outbound control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

/// Inbound publication frame.
#[derive(Debug, Deserialize)]
struct ServerFrame {
    topic: Topic,
    data: serde_json::Value,
}

/// Handles for the live connection.
struct Live {
    frames: mpsc::UnboundedSender<ClientFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// tokio-tungstenite backed [`Transport`].
pub struct WsTransport {
    url: String,
    read_timeout: Duration,
    live: Mutex<Option<Live>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            live: Mutex::new(None),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn live(&self) -> MutexGuard<'_, Option<Live>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let live = self.live();
        let Some(live) = live.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        live.frames
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    fn shutdown_live(&self) {
        if let Some(live) = self.live().take() {
            // Dropping the frame sender lets the writer close the socket.
            drop(live.frames);
            live.reader.abort();
            drop(live.writer);
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, credential: &Credential) -> Result<Publications, TransportError> {
        self.shutdown_live();

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid url: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|e| TransportError::InvalidCredential(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %self.url, "websocket connected");

        let (mut write, mut read) = stream.split();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode control frame");
                        continue;
                    }
                };
                trace!(frame = %text, "websocket send");
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let read_timeout = self.read_timeout;
        let reader = tokio::spawn(async move {
            let reason = loop {
                match tokio::time::timeout(read_timeout, read.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                let event = TransportEvent::Publication {
                                    topic: frame.topic,
                                    payload: frame.data.to_string(),
                                };
                                if events_tx.send(event).is_err() {
                                    break "receiver dropped".to_string();
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping unparseable websocket frame"),
                        }
                    }
                    Ok(Some(Ok(Message::Ping(_)))) => {
                        // tungstenite answers pings itself
                        trace!("received ping");
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break "closed by server".to_string(),
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => break format!("read error: {}", e),
                    Ok(None) => break "stream ended".to_string(),
                    Err(_) => break format!("read timeout after {}s", read_timeout.as_secs()),
                }
            };
            debug!(reason = %reason, "websocket reader finished");
            let _ = events_tx.send(TransportEvent::Closed { reason });
        });

        *self.live() = Some(Live {
            frames: frames_tx,
            reader,
            writer,
        });
        Ok(events_rx)
    }

    fn subscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.send_frame(ClientFrame::Subscribe {
            topic: topic.clone(),
        })
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.send_frame(ClientFrame::Unsubscribe {
            topic: topic.clone(),
        })
    }

    async fn close(&self) {
        self.shutdown_live();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown_live();
    }
}
