//! Human approval requests for signing

use crate::chain::{AccountId, Balance, ChainCall};
use crate::execution::ExecutionId;
use crate::utils;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Approval needed before one extrinsic is signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    pub request_id: Uuid,
    pub execution_id: ExecutionId,
    pub item_id: String,
    pub call: ChainCall,
    pub description: String,
    #[serde(with = "utils::balance_str")]
    pub estimated_fee: Balance,
    pub warnings: Vec<String>,
    pub signer: AccountId,
}

/// Approval needed before several extrinsics are signed as one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSigningRequest {
    pub request_id: Uuid,
    pub execution_id: ExecutionId,
    pub item_ids: Vec<String>,
    pub calls: Vec<ChainCall>,
    pub descriptions: Vec<String>,
    #[serde(with = "utils::balance_str")]
    pub total_estimated_fee: Balance,
    /// Deduplicated across all batch members
    pub warnings: Vec<String>,
    pub signer: AccountId,
}

/// Either kind of approval prompt, as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalPrompt {
    Single(SigningRequest),
    Batch(BatchSigningRequest),
}

impl ApprovalPrompt {
    pub fn request_id(&self) -> Uuid {
        match self {
            ApprovalPrompt::Single(r) => r.request_id,
            ApprovalPrompt::Batch(r) => r.request_id,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ApprovalPrompt::Single(r) => r.execution_id,
            ApprovalPrompt::Batch(r) => r.execution_id,
        }
    }
}

/// The user's answer to an approval prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SigningDecision {
    Approve,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SigningDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, SigningDecision::Approve)
    }
}
