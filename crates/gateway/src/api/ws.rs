//! WebSocket endpoint bridging a session hub to one client socket

use crate::app::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{ClientCommand, ServerEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketParams {
    pub session_id: String,
}

/// `GET /ws?sessionId=...`
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SocketParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, params.session_id, socket))
}

async fn serve_socket(state: Arc<AppState>, session_id: String, mut socket: WebSocket) {
    let session = state.session(&session_id).await;
    let hub = session.hub().clone();
    let (connection, mut events) = hub.connect();
    info!(session_id = %session_id, connection, "WebSocket connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => hub.handle(connection, command),
                        Err(e) => warn!(connection, error = %e, "Ignoring malformed client command"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(connection);
    info!(session_id = %session_id, connection, "WebSocket disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode server event");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::server::router;
    use crate::app::test_support;
    use broadcast::{BroadcastClient, ReconnectPolicy, WsConnector};
    use execution::ExecutionArray;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::AbortHandle;
    use types::{ExecutionItem, ExecutionStatus, ItemPayload, ServerEvent};
    use uuid::Uuid;

    /// TCP relay in front of the gateway whose live connections can be cut
    struct Relay {
        addr: SocketAddr,
        accepted: Arc<AtomicUsize>,
        live: Arc<Mutex<Vec<AbortHandle>>>,
    }

    impl Relay {
        async fn start(upstream: SocketAddr) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accepted = Arc::new(AtomicUsize::new(0));
            let live = Arc::new(Mutex::new(Vec::new()));

            let (count, handles) = (accepted.clone(), live.clone());
            tokio::spawn(async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    count.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(async move {
                        let mut outbound = TcpStream::connect(upstream).await.unwrap();
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    });
                    handles.lock().unwrap().push(task.abort_handle());
                }
            });

            Self { addr, accepted, live }
        }

        fn sever(&self) {
            for handle in self.live.lock().unwrap().drain(..) {
                handle.abort();
            }
        }
    }

    async fn wait_for_version(rx: &mut mpsc::UnboundedReceiver<ServerEvent>, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.version() >= Some(version) {
                    return;
                }
            }
        })
        .await
        .unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_client_resubscribes_after_socket_drop() {
        let state = test_support::state();
        let array = Arc::new(ExecutionArray::new(Uuid::new_v4(), "s1".to_string()));
        array
            .seed(vec![
                ExecutionItem::new("a", 0, "a", ItemPayload::DataFetch { data: serde_json::json!(1) }),
                ExecutionItem::new("b", 1, "b", ItemPayload::DataFetch { data: serde_json::json!(2) }),
            ])
            .unwrap();
        state.session("s1").await.register(array.clone()).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });
        let relay = Relay::start(upstream).await;

        let connector = WsConnector::new(&format!("ws://{}/ws", relay.addr), "s1");
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
        };
        let client = BroadcastClient::start("s1", Arc::new(connector), policy);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = client.subscribe(array.execution_id(), move |event: &ServerEvent| {
            let _ = tx.send(event.clone());
        });

        // join snapshot over the socket
        wait_for_version(&mut rx, array.snapshot().version).await;
        array.update_status("a", ExecutionStatus::Ready, None).unwrap();
        wait_for_version(&mut rx, array.snapshot().version).await;

        relay.sever();
        array.update_status("b", ExecutionStatus::Ready, None).unwrap();
        wait_until(|| relay.accepted.load(Ordering::SeqCst) >= 2).await;

        // missed update arrives through the replayed subscription
        wait_for_version(&mut rx, array.snapshot().version).await;
        wait_until(|| client.is_connected()).await;

        array.update_status("a", ExecutionStatus::Completed, None).unwrap();
        wait_for_version(&mut rx, array.snapshot().version).await;
        assert_eq!(client.subscriptions(), vec![array.execution_id()]);

        client.shutdown().await;
    }
}
