//! Transport seam between the broadcast client and a hub

use crate::hub::{ConnectionId, ExecutionHub};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use types::{ClientCommand, ExecutorError, Result, ServerEvent, SessionId};

/// One physical connection: commands out, events in
///
/// The connection is considered lost once `events` yields `None`.
pub struct Link {
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Opens connections to a broadcast server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// In-process connector talking directly to an `ExecutionHub`
#[derive(Clone)]
pub struct LocalConnector {
    hub: ExecutionHub,
    live: Arc<Mutex<Vec<ConnectionId>>>,
    refuse: Arc<Mutex<bool>>,
}

impl LocalConnector {
    pub fn new(hub: ExecutionHub) -> Self {
        Self {
            hub,
            live: Arc::new(Mutex::new(Vec::new())),
            refuse: Arc::new(Mutex::new(false)),
        }
    }

    /// Sever every connection this connector opened
    pub fn drop_connections(&self) {
        let live: Vec<ConnectionId> = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for connection in live {
            self.hub.disconnect(connection);
        }
    }

    /// Make subsequent connection attempts fail
    pub fn set_refusing(&self, refuse: bool) {
        *self.refuse.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = refuse;
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Link> {
        if *self.refuse.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            return Err(ExecutorError::Transport("connection refused".to_string()));
        }

        let (connection, events) = self.hub.connect();
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(connection);

        let (commands, mut incoming) = mpsc::unbounded_channel::<ClientCommand>();
        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(command) = incoming.recv().await {
                hub.handle(connection, command);
            }
            hub.disconnect(connection);
            debug!(connection, "Local link closed");
        });

        Ok(Link { commands, events })
    }
}

/// Connector for the gateway's WebSocket endpoint
///
/// Commands and events travel as JSON text frames. The link ends when the
/// socket closes or errors, which hands reconnection back to the client.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `endpoint` is the socket route, e.g. `ws://127.0.0.1:8080/ws`
    pub fn new(endpoint: &str, session_id: impl Into<SessionId>) -> Self {
        let session_id: SessionId = session_id.into();
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        Self {
            url: format!("{}{}sessionId={}", endpoint, separator, session_id),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ExecutorError::Transport(format!("WebSocket connect failed: {}", e)))?;
        debug!(url = %self.url, "WebSocket link established");

        let (mut sink, mut stream) = socket.split();
        let (commands, mut outgoing) = mpsc::unbounded_channel::<ClientCommand>();
        let (events_tx, events) = mpsc::unbounded_channel::<ServerEvent>();
        let url = self.url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = outgoing.recv() => {
                        let Some(command) = command else {
                            // client replaced or dropped the link
                            let _ = sink.close().await;
                            break;
                        };
                        let text = match serde_json::to_string(&command) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode client command");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                Ok(event) => {
                                    if events_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Ignoring malformed server event"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "WebSocket receive failed");
                            break;
                        }
                    }
                }
            }
            debug!(url = %url, "WebSocket link closed");
        });

        Ok(Link { commands, events })
    }
}
