//! Pre-flight plan validation
//!
//! Warnings are attached to items before anything is signed. Nothing here
//! fails a plan; predicted failures only inform the approval prompt.

use crate::traits::SimulationEngine;
use chain_client::ChainClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use types::{
    utils, AccountId, AccountInfo, Balance, ChainCall, ExecutionItem, Result,
    SequentialSimulationResult, SimulationStep,
};

/// Static validation thresholds
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub existential_deposit: Balance,
    /// Warn when a fee exceeds this share of the sender's free balance
    pub max_fee_ratio_percent: u8,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            existential_deposit: 10,
            max_fee_ratio_percent: 10,
        }
    }
}

/// Outcome of a pre-flight pass
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub warnings_added: usize,
    /// Sequential simulation over every extrinsic, when a simulator is set
    pub simulation: Option<SequentialSimulationResult>,
}

/// Attaches balance, fee and simulation warnings to planned items
pub struct PlanValidator {
    chain: Arc<dyn ChainClient>,
    simulator: Option<Arc<dyn SimulationEngine>>,
    rules: ValidationRules,
}

impl PlanValidator {
    pub fn new(chain: Arc<dyn ChainClient>, rules: ValidationRules) -> Self {
        Self {
            chain,
            simulator: None,
            rules,
        }
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn SimulationEngine>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    /// Annotate items in plan order, threading projected balances
    pub async fn annotate(&self, items: &mut [ExecutionItem]) -> Result<PreflightReport> {
        let mut report = PreflightReport::default();
        let mut projected: HashMap<AccountId, AccountInfo> = HashMap::new();

        for item in items.iter_mut() {
            let Some((call, signer)) = item.extrinsic() else {
                continue;
            };
            let (call, signer) = (call.clone(), signer.clone());

            let fee = self.chain.estimate_fee(&signer, &call).await?;
            if item.estimated_fee == 0 {
                item.estimated_fee = fee;
            }

            let mut found = Vec::new();
            self.check_fee(&signer, fee, &mut projected, &mut found).await?;
            for leaf in leaf_calls(&call) {
                self.check_call(&signer, leaf, &mut projected, &mut found).await?;
            }

            report.warnings_added += push_warnings(item, found);
        }

        if let Some(simulator) = &self.simulator {
            report.simulation = self.simulate(simulator.as_ref(), items, &mut report).await;
        }

        if report.warnings_added > 0 {
            info!(warnings = report.warnings_added, "Pre-flight validation produced warnings");
        }
        Ok(report)
    }

    async fn simulate(
        &self,
        simulator: &dyn SimulationEngine,
        items: &mut [ExecutionItem],
        report: &mut PreflightReport,
    ) -> Option<SequentialSimulationResult> {
        let positions: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_extrinsic())
            .map(|(position, _)| position)
            .collect();
        let steps: Vec<SimulationStep> = positions
            .iter()
            .filter_map(|&p| items[p].extrinsic())
            .map(|(call, signer)| SimulationStep::new(signer.clone(), call.clone()))
            .collect();
        if steps.is_empty() {
            return None;
        }

        match simulator.simulate_sequence(&steps).await {
            Ok(result) => {
                let mut found = result.warnings.clone();
                if let (Some(step), Some(failure)) = (result.failed_step, &result.failure) {
                    found.push(format!("Simulation predicts this operation fails: {}", failure));
                    report.warnings_added += push_warnings(&mut items[positions[step]], found);
                } else if let Some(&first) = positions.first() {
                    report.warnings_added += push_warnings(&mut items[first], found);
                }
                Some(result)
            }
            Err(e) => {
                warn!(error = %e, "Pre-flight simulation unavailable");
                if let Some(&first) = positions.first() {
                    report.warnings_added +=
                        push_warnings(&mut items[first], vec![format!("Simulation unavailable: {}", e)]);
                }
                None
            }
        }
    }

    async fn projected<'a>(
        &self,
        address: &AccountId,
        projected: &'a mut HashMap<AccountId, AccountInfo>,
    ) -> Result<&'a mut AccountInfo> {
        if !projected.contains_key(address) {
            let info = self.chain.account(address, None).await?;
            projected.insert(address.clone(), info);
        }
        Ok(projected.entry(address.clone()).or_default())
    }

    async fn check_fee(
        &self,
        signer: &AccountId,
        fee: Balance,
        projected: &mut HashMap<AccountId, AccountInfo>,
        found: &mut Vec<String>,
    ) -> Result<()> {
        let ratio = Balance::from(self.rules.max_fee_ratio_percent);
        let account = self.projected(signer, projected).await?;

        if account.free < fee {
            found.push(format!(
                "{} cannot pay the estimated fee of {}",
                signer, fee
            ));
        } else if fee.saturating_mul(100) > account.free.saturating_mul(ratio) {
            found.push(format!(
                "Estimated fee of {} exceeds {}% of the available balance of {}",
                fee, ratio, signer
            ));
        }
        account.free = account.free.saturating_sub(fee);
        Ok(())
    }

    async fn check_call(
        &self,
        signer: &AccountId,
        call: &ChainCall,
        projected: &mut HashMap<AccountId, AccountInfo>,
        found: &mut Vec<String>,
    ) -> Result<()> {
        let ed = self.rules.existential_deposit;
        match call {
            ChainCall::Transfer { dest, amount } => {
                let sender = self.projected(signer, projected).await?;
                if sender.free < *amount {
                    found.push(format!(
                        "Transfer of {} exceeds the available balance of {}",
                        amount, signer
                    ));
                } else if sender.free - amount < ed {
                    found.push(format!(
                        "Transfer of {} would leave {} below the existential deposit of {}",
                        amount, signer, ed
                    ));
                }
                sender.free = sender.free.saturating_sub(*amount);

                let receiver = self.projected(dest, projected).await?;
                if receiver.total().saturating_add(*amount) < ed {
                    found.push(format!(
                        "Destination {} would hold less than the existential deposit of {}",
                        dest, ed
                    ));
                }
                receiver.free = receiver.free.saturating_add(*amount);
            }
            ChainCall::Bond { amount } => {
                let stash = self.projected(signer, projected).await?;
                if stash.free < *amount {
                    found.push(format!(
                        "Bond of {} exceeds the available balance of {}",
                        amount, signer
                    ));
                }
                stash.free = stash.free.saturating_sub(*amount);
                stash.bonded = stash.bonded.saturating_add(*amount);
            }
            ChainCall::Unbond { amount } => {
                let stash = self.projected(signer, projected).await?;
                if stash.bonded < *amount {
                    found.push(format!(
                        "Unbond of {} exceeds the bonded balance of {}",
                        amount, signer
                    ));
                }
                stash.bonded = stash.bonded.saturating_sub(*amount);
                stash.free = stash.free.saturating_add(*amount);
            }
            // batches are flattened by the caller
            ChainCall::Remark { .. } | ChainCall::Batch { .. } => {}
        }
        Ok(())
    }
}

/// Leaf calls in dispatch order
fn leaf_calls(call: &ChainCall) -> Vec<&ChainCall> {
    match call {
        ChainCall::Batch { calls } => calls.iter().flat_map(leaf_calls).collect(),
        other => vec![other],
    }
}

/// Append new warnings without duplicates, returning how many were added
fn push_warnings(item: &mut ExecutionItem, found: Vec<String>) -> usize {
    let before = item.warnings.len();
    let merged: Vec<String> = item.warnings.iter().chain(found.iter()).cloned().collect();
    item.warnings = utils::dedup_warnings(&merged);
    item.warnings.len() - before
}
