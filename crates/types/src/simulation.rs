//! Simulation results

use crate::chain::{AccountId, Balance, BlockHash, ChainCall, ChainEvent, DispatchError};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One call to dry-run, with the account it is sent from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStep {
    pub origin: AccountId,
    pub call: ChainCall,
}

impl SimulationStep {
    pub fn new(origin: AccountId, call: ChainCall) -> Self {
        Self { origin, call }
    }
}

/// Why a simulated call would fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The runtime rejected the call during dispatch
    Dispatch(DispatchError),
    /// The transaction would never be accepted (fees, nonce, signature)
    Invalid { reason: String },
    /// The simulation could not reach a verdict
    Transport { reason: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Dispatch(err) => write!(f, "{}", err),
            FailureReason::Invalid { reason } => write!(f, "Invalid transaction: {}", reason),
            FailureReason::Transport { reason } => write!(f, "Simulation unavailable: {}", reason),
        }
    }
}

/// Direction of a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceDirection {
    Credit,
    Debit,
}

/// Predicted change of one account's free balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub account: AccountId,
    #[serde(with = "utils::balance_str")]
    pub amount: Balance,
    pub direction: BalanceDirection,
}

impl BalanceDelta {
    /// Delta between two balance readings, `None` when unchanged
    pub fn between(account: AccountId, before: Balance, after: Balance) -> Option<Self> {
        if after > before {
            Some(Self {
                account,
                amount: after - before,
                direction: BalanceDirection::Credit,
            })
        } else if before > after {
            Some(Self {
                account,
                amount: before - after,
                direction: BalanceDirection::Debit,
            })
        } else {
            None
        }
    }

    /// Signed amount, credits positive
    pub fn signed(&self) -> i128 {
        let amount = i128::try_from(self.amount).unwrap_or(i128::MAX);
        match self.direction {
            BalanceDirection::Credit => amount,
            BalanceDirection::Debit => -amount,
        }
    }

    fn from_signed(account: AccountId, value: i128) -> Option<Self> {
        if value == 0 {
            return None;
        }
        Some(Self {
            account,
            amount: value.unsigned_abs(),
            direction: if value > 0 {
                BalanceDirection::Credit
            } else {
                BalanceDirection::Debit
            },
        })
    }
}

/// Net per-account deltas, summed arithmetically
pub fn net_balance_deltas<'a, I>(deltas: I) -> Vec<BalanceDelta>
where
    I: IntoIterator<Item = &'a BalanceDelta>,
{
    let mut totals: BTreeMap<AccountId, i128> = BTreeMap::new();
    for delta in deltas {
        let entry = totals.entry(delta.account.clone()).or_insert(0);
        *entry = entry.saturating_add(delta.signed());
    }
    totals
        .into_iter()
        .filter_map(|(account, value)| BalanceDelta::from_signed(account, value))
        .collect()
}

/// How much the simulation can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Simulated at the requested finalized block
    Full,
    /// Fork fell back to a different block
    Reduced,
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Full
    }
}

/// Outcome of dry-running one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub success: bool,
    pub failure: Option<FailureReason>,
    #[serde(with = "utils::balance_str")]
    pub estimated_fee: Balance,
    pub balance_deltas: Vec<BalanceDelta>,
    pub events: Vec<ChainEvent>,
    pub block_hash: BlockHash,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SimulationResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Human-readable failure reason
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }
}

/// Outcome of dry-running a chain of calls on one fork
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequentialSimulationResult {
    pub success: bool,
    /// One result per simulated step, up to and including the failing one
    pub steps: Vec<SimulationResult>,
    /// Zero-based index of the first failing step
    pub failed_step: Option<usize>,
    pub failure: Option<FailureReason>,
    /// Sum over successful steps only
    #[serde(with = "utils::balance_str")]
    pub cumulative_fee: Balance,
    /// Net over successful steps only
    pub net_balance_deltas: Vec<BalanceDelta>,
    pub block_hash: BlockHash,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SequentialSimulationResult {
    /// Human-readable failure with the step index
    pub fn error_message(&self) -> Option<String> {
        match (&self.failure, self.failed_step) {
            (Some(failure), Some(step)) => Some(format!("Step {} failed: {}", step + 1, failure)),
            (Some(failure), None) => Some(failure.to_string()),
            _ => None,
        }
    }
}
