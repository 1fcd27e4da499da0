//! Execution items, statuses and array snapshots

use crate::chain::{AccountId, Balance, BlockHash, ChainCall, ChainEvent, TxHash};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an execution (one seeded plan)
pub type ExecutionId = Uuid;

/// Identifier of the client session that owns executions
pub type SessionId = String;

/// Kind of work an item represents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Signable chain operation
    Extrinsic,
    /// Already fetched data to surface
    DataFetch,
    /// Pre-computed validation outcome
    Validation,
    /// Requires a value from the user
    UserInput,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Extrinsic => "extrinsic",
            ExecutionType::DataFetch => "data_fetch",
            ExecutionType::Validation => "validation",
            ExecutionType::UserInput => "user_input",
        }
    }
}

/// Item payload, one variant per execution type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executionType", rename_all = "snake_case")]
pub enum ItemPayload {
    Extrinsic {
        call: ChainCall,
        signer: AccountId,
    },
    DataFetch {
        data: serde_json::Value,
    },
    Validation {
        passed: bool,
        #[serde(default)]
        data: serde_json::Value,
    },
    UserInput {
        prompt: String,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
}

impl ItemPayload {
    pub fn execution_type(&self) -> ExecutionType {
        match self {
            ItemPayload::Extrinsic { .. } => ExecutionType::Extrinsic,
            ItemPayload::DataFetch { .. } => ExecutionType::DataFetch,
            ItemPayload::Validation { .. } => ExecutionType::Validation,
            ItemPayload::UserInput { .. } => ExecutionType::UserInput,
        }
    }
}

/// Status of an item in the execution pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Ready,
    Signing,
    Broadcasting,
    /// Extrinsic included in a finalized block
    Finalized,
    /// Non-extrinsic item done
    Completed,
    Failed,
    /// User rejected signing
    Cancelled,
}

impl ExecutionStatus {
    /// Position along the forward-only state graph
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Ready => 1,
            ExecutionStatus::Signing => 2,
            ExecutionStatus::Broadcasting => 3,
            ExecutionStatus::Finalized
            | ExecutionStatus::Completed
            | ExecutionStatus::Failed
            | ExecutionStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Whether `next` is a legal move from `self`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Pending, Ready | Completed | Failed | Cancelled) => true,
            (Ready, Signing | Completed | Failed | Cancelled) => true,
            (Signing, Broadcasting | Failed | Cancelled) => true,
            (Broadcasting, Finalized | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Ready => "ready",
            ExecutionStatus::Signing => "signing",
            ExecutionStatus::Broadcasting => "broadcasting",
            ExecutionStatus::Finalized => "finalized",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Pending
    }
}

/// Outcome attached to an item when it reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub tx_hash: Option<TxHash>,
    pub block_hash: Option<BlockHash>,
    #[serde(default)]
    pub events: Vec<ChainEvent>,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Successful non-extrinsic result
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            tx_hash: None,
            block_hash: None,
            events: Vec::new(),
            data: Some(data),
            error: None,
        }
    }

    /// Successful on-chain result
    pub fn finalized(tx_hash: TxHash, block_hash: BlockHash, events: Vec<ChainEvent>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            block_hash: Some(block_hash),
            events,
            data: None,
            error: None,
        }
    }

    /// Failed result with a human-readable reason
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            block_hash: None,
            events: Vec::new(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// One planned operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionItem {
    pub id: String,
    pub index: usize,
    pub description: String,
    pub payload: ItemPayload,
    #[serde(with = "utils::balance_str")]
    pub estimated_fee: Balance,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: ExecutionStatus,
    pub result: Option<ExecutionResult>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionItem {
    /// Create a pending item
    pub fn new(id: impl Into<String>, index: usize, description: impl Into<String>, payload: ItemPayload) -> Self {
        Self {
            id: id.into(),
            index,
            description: description.into(),
            payload,
            estimated_fee: 0,
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
            status: ExecutionStatus::Pending,
            result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.payload.execution_type()
    }

    pub fn is_extrinsic(&self) -> bool {
        matches!(self.payload, ItemPayload::Extrinsic { .. })
    }

    /// Call and signer for extrinsic items
    pub fn extrinsic(&self) -> Option<(&ChainCall, &AccountId)> {
        match &self.payload {
            ItemPayload::Extrinsic { call, signer } => Some((call, signer)),
            _ => None,
        }
    }
}

/// Snapshot of an execution array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionArrayState {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub items: Vec<ExecutionItem>,
    pub current_index: Option<usize>,
    pub is_executing: bool,
    pub is_paused: bool,
    pub completed_items: usize,
    pub failed_items: usize,
    pub cancelled_items: usize,
    pub total_items: usize,
    /// Incremented on every mutation
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionArrayState {
    /// Empty state for a new execution
    pub fn new(execution_id: ExecutionId, session_id: SessionId) -> Self {
        Self {
            execution_id,
            session_id,
            items: Vec::new(),
            current_index: None,
            is_executing: false,
            is_paused: false,
            completed_items: 0,
            failed_items: 0,
            cancelled_items: 0,
            total_items: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Recompute derived counts
    pub fn recount(&mut self) {
        self.total_items = self.items.len();
        self.completed_items = self
            .items
            .iter()
            .filter(|i| matches!(i.status, ExecutionStatus::Finalized | ExecutionStatus::Completed))
            .count();
        self.failed_items = self
            .items
            .iter()
            .filter(|i| i.status == ExecutionStatus::Failed)
            .count();
        self.cancelled_items = self
            .items
            .iter()
            .filter(|i| i.status == ExecutionStatus::Cancelled)
            .count();
    }

    pub fn item(&self, id: &str) -> Option<&ExecutionItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// No item is waiting or in flight
    pub fn is_settled(&self) -> bool {
        self.items.iter().all(|i| i.status.is_terminal())
    }
}

/// Notification delivered to execution array observers
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayEvent {
    /// Any mutation of the array
    Updated(ExecutionArrayState),
    /// Fired once per `execute()` run, after cleanup
    Completed {
        state: ExecutionArrayState,
        success: bool,
        error: Option<String>,
    },
}

impl ArrayEvent {
    pub fn state(&self) -> &ExecutionArrayState {
        match self {
            ArrayEvent::Updated(state) => state,
            ArrayEvent::Completed { state, .. } => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Signing));
        assert!(Signing.can_transition_to(Broadcasting));
        assert!(Broadcasting.can_transition_to(Finalized));
        assert!(Pending.can_transition_to(Completed));

        assert!(!Ready.can_transition_to(Pending));
        assert!(!Broadcasting.can_transition_to(Signing));
        assert!(!Broadcasting.can_transition_to(Cancelled));
        assert!(!Signing.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_statuses_are_immutable() {
        for terminal in [Finalized, Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Ready, Signing, Broadcasting, Finalized, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_payload_tagged_by_execution_type() {
        let payload: ItemPayload = serde_json::from_value(serde_json::json!({
            "executionType": "extrinsic",
            "call": { "call": "transfer", "dest": "bob", "amount": "100" },
            "signer": "alice"
        }))
        .unwrap();
        assert_eq!(payload.execution_type(), ExecutionType::Extrinsic);

        let payload: ItemPayload = serde_json::from_value(serde_json::json!({
            "executionType": "data_fetch",
            "data": { "balance": "42" }
        }))
        .unwrap();
        assert_eq!(payload.execution_type(), ExecutionType::DataFetch);
    }

    #[test]
    fn test_recount() {
        let mut state = ExecutionArrayState::new(Uuid::new_v4(), "s1".to_string());
        let payload = ItemPayload::DataFetch { data: serde_json::json!(1) };
        let mut a = ExecutionItem::new("a", 0, "a", payload.clone());
        a.status = Completed;
        let mut b = ExecutionItem::new("b", 1, "b", payload.clone());
        b.status = Failed;
        let c = ExecutionItem::new("c", 2, "c", payload);
        state.items = vec![a, b, c];
        state.recount();

        assert_eq!(state.total_items, 3);
        assert_eq!(state.completed_items, 1);
        assert_eq!(state.failed_items, 1);
        assert!(!state.is_settled());
    }
}
