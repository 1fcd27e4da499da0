//! Real-time wire protocol between the gateway and clients

use crate::execution::{ExecutionArrayState, ExecutionId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server to client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    ExecutionUpdate {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        state: ExecutionArrayState,
    },
    ExecutionComplete {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        success: bool,
    },
    ExecutionError {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        error: String,
    },
}

impl ServerEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ServerEvent::ExecutionUpdate { execution_id, .. }
            | ServerEvent::ExecutionComplete { execution_id, .. }
            | ServerEvent::ExecutionError { execution_id, .. } => *execution_id,
        }
    }

    /// Snapshot version carried by update events
    pub fn version(&self) -> Option<u64> {
        match self {
            ServerEvent::ExecutionUpdate { state, .. } => Some(state.version),
            _ => None,
        }
    }
}

/// Client to server command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClientCommand {
    SubscribeExecution {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
    },
    UnsubscribeExecution {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
    },
    SubscribeSessionExecutions {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    UnsubscribeSessionExecutions {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
}

/// Broadcast room a connection can join
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKey {
    Execution(ExecutionId),
    Session(SessionId),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Execution(id) => write!(f, "execution:{}", id),
            RoomKey::Session(id) => write!(f, "session:{}", id),
        }
    }
}
