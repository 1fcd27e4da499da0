//! Client-side broadcast subscriptions
//!
//! Subscriptions live in a durable set owned by the client, not by the
//! physical connection. Whenever a connection is (re)established every held
//! subscription is re-issued, and the server's join snapshot brings each
//! execution up to date. Updates are deduplicated by snapshot version.

use crate::connector::Connector;
use config::BroadcastConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::{ClientCommand, ExecutionId, ServerEvent, SessionId};

/// Callback invoked for every delivered event
pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl From<&BroadcastConfig> for ReconnectPolicy {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.max_reconnect_delay_ms.max(config.reconnect_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Execution(ExecutionId),
    Session,
}

#[derive(Default)]
struct ClientState {
    next_id: u64,
    executions: HashMap<ExecutionId, BTreeMap<u64, EventCallback>>,
    session: BTreeMap<u64, EventCallback>,
    last_version: HashMap<ExecutionId, u64>,
    link: Option<mpsc::UnboundedSender<ClientCommand>>,
}

struct Shared {
    session_id: SessionId,
    state: Mutex<ClientState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a fresh link and re-issue every held subscription on it
    fn install(&self, commands: mpsc::UnboundedSender<ClientCommand>) -> usize {
        let mut state = self.lock();
        let mut issued = 0;
        for execution_id in state.executions.keys() {
            let _ = commands.send(ClientCommand::SubscribeExecution {
                session_id: self.session_id.clone(),
                execution_id: *execution_id,
            });
            issued += 1;
        }
        if !state.session.is_empty() {
            let _ = commands.send(ClientCommand::SubscribeSessionExecutions {
                session_id: self.session_id.clone(),
            });
            issued += 1;
        }
        state.link = Some(commands);
        issued
    }

    fn clear_link(&self) {
        self.lock().link = None;
    }

    fn send(state: &ClientState, command: ClientCommand) {
        if let Some(link) = &state.link {
            let _ = link.send(command);
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let callbacks: Vec<EventCallback> = {
            let mut state = self.lock();
            let execution_id = event.execution_id();

            if let Some(version) = event.version() {
                let last = state.last_version.get(&execution_id).copied();
                if last.map_or(false, |v| v >= version) {
                    debug!(execution_id = %execution_id, version, "Dropping stale update");
                    return;
                }
                state.last_version.insert(execution_id, version);
            }

            state
                .executions
                .get(&execution_id)
                .into_iter()
                .flat_map(|callbacks| callbacks.values())
                .chain(state.session.values())
                .cloned()
                .collect()
        };

        for callback in callbacks {
            callback(&event);
        }
    }

    fn remove(&self, target: Target, id: u64) {
        let mut state = self.lock();
        match target {
            Target::Execution(execution_id) => {
                let emptied = match state.executions.get_mut(&execution_id) {
                    Some(callbacks) => callbacks.remove(&id).is_some() && callbacks.is_empty(),
                    None => false,
                };
                if emptied {
                    state.executions.remove(&execution_id);
                    if state.session.is_empty() {
                        state.last_version.remove(&execution_id);
                    }
                    Self::send(&state, ClientCommand::UnsubscribeExecution { execution_id });
                }
            }
            Target::Session => {
                if state.session.remove(&id).is_some() && state.session.is_empty() {
                    let session_id = self.session_id.clone();
                    Self::send(&state, ClientCommand::UnsubscribeSessionExecutions { session_id });
                }
            }
        }
    }
}

/// Handle returned by `subscribe`; unsubscribing is idempotent
pub struct Subscription {
    shared: Weak<Shared>,
    target: Target,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.target, self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Session-scoped subscriber that survives reconnects
pub struct BroadcastClient {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BroadcastClient {
    /// Spawn the connection loop for `session_id`
    pub fn start(session_id: impl Into<SessionId>, connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let shared = Arc::new(Shared {
            session_id: session_id.into(),
            state: Mutex::new(ClientState::default()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), connector, policy, cancel.clone()));
        Self {
            shared,
            cancel,
            task: Some(task),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().link.is_some()
    }

    /// Observe one execution
    pub fn subscribe<F>(&self, execution_id: ExecutionId, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        let id = next_id(&mut state);
        let room = state.executions.entry(execution_id).or_default();
        let first = room.is_empty();
        room.insert(id, Arc::new(callback));
        if first {
            Shared::send(
                &state,
                ClientCommand::SubscribeExecution {
                    session_id: self.shared.session_id.clone(),
                    execution_id,
                },
            );
        }
        self.handle(Target::Execution(execution_id), id)
    }

    /// Observe every execution of the session, including ones not yet created
    pub fn subscribe_session<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        let id = next_id(&mut state);
        let first = state.session.is_empty();
        state.session.insert(id, Arc::new(callback));
        if first {
            Shared::send(
                &state,
                ClientCommand::SubscribeSessionExecutions {
                    session_id: self.shared.session_id.clone(),
                },
            );
        }
        self.handle(Target::Session, id)
    }

    /// Subscribed execution ids
    pub fn subscriptions(&self) -> Vec<ExecutionId> {
        self.shared.lock().executions.keys().copied().collect()
    }

    /// Stop the connection loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn handle(&self, target: Target, id: u64) -> Subscription {
        Subscription {
            shared: Arc::downgrade(&self.shared),
            target,
            id,
            active: AtomicBool::new(true),
        }
    }
}

impl Drop for BroadcastClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn next_id(state: &mut ClientState) -> u64 {
    state.next_id += 1;
    state.next_id
}

async fn run(shared: Arc<Shared>, connector: Arc<dyn Connector>, policy: ReconnectPolicy, cancel: CancellationToken) {
    let mut delay = policy.initial_delay;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connector.connect().await {
            Ok(link) => {
                delay = policy.initial_delay;
                let reissued = shared.install(link.commands);
                info!(session_id = %shared.session_id, reissued, "Broadcast connection established");

                let mut events = link.events;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            shared.clear_link();
                            return;
                        }
                        event = events.recv() => match event {
                            Some(event) => shared.dispatch(event),
                            None => break,
                        },
                    }
                }

                shared.clear_link();
                warn!(session_id = %shared.session_id, "Broadcast connection lost");
            }
            Err(e) => {
                warn!(session_id = %shared.session_id, error = %e, retry_in_ms = delay.as_millis() as u64, "Broadcast connect failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(policy.max_delay);
    }
    debug!(session_id = %shared.session_id, "Broadcast client stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LocalConnector;
    use crate::hub::ExecutionHub;
    use execution::ExecutionArray;
    use types::{ExecutionItem, ExecutionStatus, ItemPayload, RoomKey};
    use uuid::Uuid;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    fn seeded(session: &str) -> Arc<ExecutionArray> {
        let array = ExecutionArray::new(Uuid::new_v4(), session.to_string());
        array
            .seed(vec![
                ExecutionItem::new("a", 0, "a", ItemPayload::DataFetch { data: serde_json::json!(1) }),
                ExecutionItem::new("b", 1, "b", ItemPayload::DataFetch { data: serde_json::json!(2) }),
                ExecutionItem::new("c", 2, "c", ItemPayload::DataFetch { data: serde_json::json!(3) }),
            ])
            .unwrap();
        Arc::new(array)
    }

    fn recorder() -> (
        impl Fn(&ServerEvent) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event: &ServerEvent| {
                let _ = tx.send(event.clone());
            },
            rx,
        )
    }

    async fn next_version(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> u64 {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Some(version) = event.version() {
                return version;
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_receives_snapshot_and_updates() {
        let hub = ExecutionHub::new("s1");
        let array = seeded("s1");
        hub.attach(&array);
        let client = BroadcastClient::start("s1", Arc::new(LocalConnector::new(hub.clone())), policy());

        let (callback, mut rx) = recorder();
        let _sub = client.subscribe(array.execution_id(), callback);

        assert_eq!(next_version(&mut rx).await, array.snapshot().version);
        array.update_status("a", ExecutionStatus::Ready, None).unwrap();
        assert_eq!(next_version(&mut rx).await, array.snapshot().version);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_reissues_subscriptions() {
        let hub = ExecutionHub::new("s1");
        let array = seeded("s1");
        hub.attach(&array);
        let connector = LocalConnector::new(hub.clone());
        let client = BroadcastClient::start("s1", Arc::new(connector.clone()), policy());

        let (callback, mut rx) = recorder();
        let _sub = client.subscribe(array.execution_id(), callback);
        let joined = next_version(&mut rx).await;

        connector.set_refusing(true);
        connector.drop_connections();
        wait_until(|| !client.is_connected()).await;

        // published while disconnected
        array.update_status("a", ExecutionStatus::Ready, None).unwrap();
        array.update_status("b", ExecutionStatus::Ready, None).unwrap();

        connector.set_refusing(false);
        wait_until(|| hub.room_size(&RoomKey::Execution(array.execution_id())) == 1).await;

        let resent = next_version(&mut rx).await;
        assert_eq!(resent, joined + 2);

        array.update_status("c", ExecutionStatus::Ready, None).unwrap();
        assert_eq!(next_version(&mut rx).await, resent + 1);
        assert!(rx.try_recv().is_err());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_without_changes_delivers_no_duplicates() {
        let hub = ExecutionHub::new("s1");
        let array = seeded("s1");
        hub.attach(&array);
        let connector = LocalConnector::new(hub.clone());
        let client = BroadcastClient::start("s1", Arc::new(connector.clone()), policy());

        let (callback, mut rx) = recorder();
        let _sub = client.subscribe(array.execution_id(), callback);
        let joined = next_version(&mut rx).await;

        connector.drop_connections();
        wait_until(|| hub.room_size(&RoomKey::Execution(array.execution_id())) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        array.update_status("a", ExecutionStatus::Ready, None).unwrap();
        assert_eq!(next_version(&mut rx).await, joined + 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_leaves_room() {
        let hub = ExecutionHub::new("s1");
        let array = seeded("s1");
        hub.attach(&array);
        let client = BroadcastClient::start("s1", Arc::new(LocalConnector::new(hub.clone())), policy());
        let room = RoomKey::Execution(array.execution_id());

        let (first_cb, _first_rx) = recorder();
        let (second_cb, _second_rx) = recorder();
        let first = client.subscribe(array.execution_id(), first_cb);
        let second = client.subscribe(array.execution_id(), second_cb);
        wait_until(|| hub.room_size(&room) == 1).await;

        first.unsubscribe();
        first.unsubscribe();
        assert!(!first.is_active());
        assert_eq!(client.subscriptions().len(), 1);

        second.unsubscribe();
        assert!(client.subscriptions().is_empty());
        wait_until(|| hub.room_size(&room) == 0).await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_subscription_sees_new_executions() {
        let hub = ExecutionHub::new("s1");
        let client = BroadcastClient::start("s1", Arc::new(LocalConnector::new(hub.clone())), policy());

        let (callback, mut rx) = recorder();
        let _sub = client.subscribe_session(callback);
        wait_until(|| hub.room_size(&RoomKey::Session("s1".to_string())) == 1).await;

        let array = seeded("s1");
        hub.attach(&array);
        array.update_status("a", ExecutionStatus::Ready, None).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.execution_id(), array.execution_id());

        client.shutdown().await;
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::from(&BroadcastConfig {
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 50,
        });
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(100));
    }
}
