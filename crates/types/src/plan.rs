//! Planner output consumed by the engine

use crate::chain::{AccountId, Balance, ChainCall};
use crate::execution::ExecutionType;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One step produced by the upstream planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    /// Stable id, generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub execution_type: ExecutionType,
    /// Signable call for extrinsics
    #[serde(default)]
    pub call: Option<ChainCall>,
    #[serde(default)]
    pub signer: Option<AccountId>,
    /// Already materialized data for data_fetch / validation / user_input
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default, with = "utils::balance_str")]
    pub estimated_fee: Balance,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}
