//! Server-side room hub
//!
//! A hub belongs to one session. Connections join rooms keyed by execution
//! id or by the session itself; every array mutation is published to both
//! rooms, and each connection receives it once.

use execution::{ExecutionArray, ObserverId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::{ArrayEvent, ClientCommand, ExecutionArrayState, ExecutionId, RoomKey, ServerEvent, SessionId};

/// Identifier of one physical connection
pub type ConnectionId = u64;

struct Peer {
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// Last update version delivered, per execution
    delivered: HashMap<ExecutionId, u64>,
    /// Snapshot version of the last completion delivered, per execution
    completed: HashMap<ExecutionId, u64>,
}

/// Outcome of the most recent run of an execution
#[derive(Debug, Clone)]
struct Completion {
    version: u64,
    success: bool,
    error: Option<String>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<ConnectionId, Peer>,
    rooms: HashMap<RoomKey, BTreeSet<ConnectionId>>,
    latest: BTreeMap<ExecutionId, ExecutionArrayState>,
    completions: HashMap<ExecutionId, Completion>,
    attached: HashMap<ExecutionId, (Weak<ExecutionArray>, ObserverId)>,
}

/// Fan-out of execution state to subscribed connections
#[derive(Clone)]
pub struct ExecutionHub {
    session_id: SessionId,
    state: Arc<Mutex<HubState>>,
    next_connection: Arc<AtomicU64>,
}

impl ExecutionHub {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            state: Arc::new(Mutex::new(HubState::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a connection; events for it arrive on the receiver
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().peers.insert(
            id,
            Peer {
                tx,
                delivered: HashMap::new(),
                completed: HashMap::new(),
            },
        );
        debug!(session_id = %self.session_id, connection = id, "Connection registered");
        (id, rx)
    }

    /// Drop a connection and leave every room it joined
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.lock();
        if state.peers.remove(&connection).is_none() {
            return;
        }
        state.rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
        debug!(session_id = %self.session_id, connection, "Connection removed");
    }

    pub fn connection_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.lock().peers.keys().copied().collect()
    }

    /// Members currently in `room`
    pub fn room_size(&self, room: &RoomKey) -> usize {
        self.lock().rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Start publishing an array's mutations
    pub fn attach(&self, array: &Arc<ExecutionArray>) {
        let execution_id = array.execution_id();
        if self.lock().attached.contains_key(&execution_id) {
            return;
        }

        let hub = self.clone();
        let observer = array.subscribe(move |event| hub.publish(event));

        let mut state = self.lock();
        state.latest.insert(execution_id, array.snapshot());
        state.attached.insert(execution_id, (Arc::downgrade(array), observer));
        info!(session_id = %self.session_id, execution_id = %execution_id, "Execution attached to hub");
    }

    /// Stop publishing an execution and forget its last snapshot
    pub fn detach(&self, execution_id: &ExecutionId) {
        let attached = {
            let mut state = self.lock();
            state.latest.remove(execution_id);
            state.completions.remove(execution_id);
            state.rooms.remove(&RoomKey::Execution(*execution_id));
            for peer in state.peers.values_mut() {
                peer.delivered.remove(execution_id);
                peer.completed.remove(execution_id);
            }
            state.attached.remove(execution_id)
        };
        if let Some((array, observer)) = attached {
            if let Some(array) = array.upgrade() {
                array.unsubscribe(observer);
            }
        }
    }

    /// Latest published snapshot, for late joiners pulling state
    pub fn latest(&self, execution_id: &ExecutionId) -> Option<ExecutionArrayState> {
        self.lock().latest.get(execution_id).cloned()
    }

    /// Apply a client command on behalf of `connection`
    pub fn handle(&self, connection: ConnectionId, command: ClientCommand) {
        match command {
            ClientCommand::SubscribeExecution {
                session_id,
                execution_id,
            } => {
                if self.foreign(&session_id, connection) {
                    return;
                }
                self.join(connection, RoomKey::Execution(execution_id));
            }
            ClientCommand::UnsubscribeExecution { execution_id } => {
                self.leave(connection, &RoomKey::Execution(execution_id));
            }
            ClientCommand::SubscribeSessionExecutions { session_id } => {
                if self.foreign(&session_id, connection) {
                    return;
                }
                self.join(connection, RoomKey::Session(session_id));
            }
            ClientCommand::UnsubscribeSessionExecutions { session_id } => {
                self.leave(connection, &RoomKey::Session(session_id));
            }
        }
    }

    /// Publish one array event to its execution room and the session room
    pub fn publish(&self, event: &ArrayEvent) {
        let state_ref = event.state();
        let execution_id = state_ref.execution_id;
        let mut state = self.lock();

        let recipients: BTreeSet<ConnectionId> = [
            RoomKey::Execution(execution_id),
            RoomKey::Session(state_ref.session_id.clone()),
        ]
        .iter()
        .filter_map(|room| state.rooms.get(room))
        .flatten()
        .copied()
        .collect();

        match event {
            ArrayEvent::Updated(snapshot) => {
                // a new run supersedes the previous outcome
                if snapshot.is_executing {
                    state.completions.remove(&execution_id);
                }
                state.latest.insert(execution_id, snapshot.clone());
                for connection in recipients {
                    deliver_update(&mut state, connection, snapshot);
                }
            }
            ArrayEvent::Completed { success, error, .. } => {
                let completion = Completion {
                    version: state_ref.version,
                    success: *success,
                    error: error.clone(),
                };
                state.completions.insert(execution_id, completion.clone());
                for connection in recipients {
                    deliver_completion(&mut state, connection, execution_id, &completion);
                }
            }
        }
    }

    fn foreign(&self, session_id: &str, connection: ConnectionId) -> bool {
        if session_id != self.session_id {
            warn!(
                session_id = %self.session_id,
                requested = %session_id,
                connection,
                "Ignoring subscription for another session"
            );
            return true;
        }
        false
    }

    fn join(&self, connection: ConnectionId, room: RoomKey) {
        let mut state = self.lock();
        if !state.peers.contains_key(&connection) {
            return;
        }
        state.rooms.entry(room.clone()).or_default().insert(connection);
        debug!(connection, room = %room, "Joined room");

        // Bring the joiner up to date, finished runs included
        let snapshots: Vec<ExecutionArrayState> = match &room {
            RoomKey::Execution(id) => state.latest.get(id).cloned().into_iter().collect(),
            RoomKey::Session(_) => state.latest.values().cloned().collect(),
        };
        for snapshot in &snapshots {
            deliver_update(&mut state, connection, snapshot);
            if let Some(completion) = state.completions.get(&snapshot.execution_id).cloned() {
                deliver_completion(&mut state, connection, snapshot.execution_id, &completion);
            }
        }
    }

    fn leave(&self, connection: ConnectionId, room: &RoomKey) {
        let mut state = self.lock();
        let now_empty = match state.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&connection);
                members.is_empty()
            }
            None => return,
        };
        if now_empty {
            state.rooms.remove(room);
            debug!(room = %room, "Room closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Send an update unless the connection already has this version or newer
fn deliver_update(state: &mut HubState, connection: ConnectionId, snapshot: &ExecutionArrayState) {
    let Some(peer) = state.peers.get_mut(&connection) else {
        return;
    };
    let last = peer.delivered.get(&snapshot.execution_id).copied();
    if last.map_or(false, |v| v >= snapshot.version) {
        return;
    }
    peer.delivered.insert(snapshot.execution_id, snapshot.version);
    let _ = peer.tx.send(ServerEvent::ExecutionUpdate {
        execution_id: snapshot.execution_id,
        state: snapshot.clone(),
    });
}

/// Send a run's outcome unless the connection already received it
fn deliver_completion(
    state: &mut HubState,
    connection: ConnectionId,
    execution_id: ExecutionId,
    completion: &Completion,
) {
    let Some(peer) = state.peers.get_mut(&connection) else {
        return;
    };
    let last = peer.completed.get(&execution_id).copied();
    if last.map_or(false, |v| v >= completion.version) {
        return;
    }
    peer.completed.insert(execution_id, completion.version);
    let _ = peer.tx.send(ServerEvent::ExecutionComplete {
        execution_id,
        success: completion.success,
    });
    if let Some(error) = &completion.error {
        let _ = peer.tx.send(ServerEvent::ExecutionError {
            execution_id,
            error: error.clone(),
        });
    }
}
