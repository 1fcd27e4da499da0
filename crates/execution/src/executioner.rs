//! Executioner: drives an execution array to completion
//!
//! One `execute()` run drains the array's pending items. Non-extrinsic items
//! complete locally. Extrinsics go through approval, signing, submission and
//! finality, either one by one or grouped into atomic batches with automatic
//! fallback to individual execution when a batch fails.
//!
//! Per-item failures are recorded on the item. They abort the run unless
//! `continue_on_error` is set. Transport failures (finality timeouts, lost
//! connections) always abort the run; items that were never attempted stay
//! `pending` so the caller can re-invoke `execute()`.

use crate::approval::{ApprovalQueue, DROPPED_REASON};
use crate::array::ExecutionArray;
use crate::options::ExecutionOptions;
use chain_client::{ChainClient, Signer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use types::{
    utils, AccountId, ApprovalPrompt, BatchSigningRequest, BlockInclusion, ChainCall, ChainError,
    ExecutionItem, ExecutionResult, ExecutionStatus, ExecutorError, ItemPayload, Result,
    SignedPayload, SigningDecision, SigningRequest, TxHash, TxStatus,
};
use uuid::Uuid;

/// Why a submitted transaction did not reach finality
enum BroadcastFailure {
    /// The chain refused or dropped it; the item fails
    Rejected(String),
    /// Connection lost or timed out; the run aborts
    Transport(ExecutorError),
}

/// Drives execution arrays against a chain
pub struct Executioner {
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    approvals: Option<ApprovalQueue>,
}

impl Executioner {
    pub fn new(chain: Arc<dyn ChainClient>, signer: Arc<dyn Signer>) -> Self {
        Self {
            chain,
            signer,
            approvals: None,
        }
    }

    /// Route approval prompts to `queue`
    pub fn with_approvals(mut self, queue: ApprovalQueue) -> Self {
        self.approvals = Some(queue);
        self
    }

    /// Run every pending item of `array`
    ///
    /// Fails with `AlreadyExecuting` if another run holds the array. On every
    /// exit path, including cancellation of the returned future, the array
    /// is marked idle and observers receive a completion event.
    ///
    /// With batching on and two or more pending extrinsics, every
    /// non-extrinsic item runs before any extrinsic, so items no longer run
    /// in index order and a failing validation can stop the run while
    /// lower-indexed extrinsics are still pending.
    pub async fn execute(&self, array: &Arc<ExecutionArray>, options: &ExecutionOptions) -> Result<()> {
        array.begin_execution()?;
        let mut guard = RunGuard::new(array);

        let execution_id = array.execution_id();
        info!(
            execution_id = %execution_id,
            sequential = options.sequential,
            batching = options.allow_batching,
            signer = self.signer.name(),
            "Starting execution"
        );

        let result = self.run(array, options).await;
        match &result {
            Ok(()) => info!(execution_id = %execution_id, "Execution finished"),
            Err(e) if e.is_transport() => {
                error!(execution_id = %execution_id, error = %e, "Execution aborted by transport failure")
            }
            Err(e) => warn!(execution_id = %execution_id, error = %e, "Execution stopped"),
        }

        guard.finish(&result);
        result
    }

    async fn run(&self, array: &Arc<ExecutionArray>, options: &ExecutionOptions) -> Result<()> {
        let pending = array.ready_items();
        let extrinsics = pending.iter().filter(|item| item.is_extrinsic()).count();

        if extrinsics > 0 && !options.auto_approve && self.approvals.is_none() {
            return Err(ExecutorError::Config(
                "no signing approval handler registered and auto-approve is off".to_string(),
            ));
        }

        let defer = options.allow_batching && extrinsics >= 2;
        if defer {
            debug!(extrinsics, "Deferring extrinsics to the batching pass");
        }

        if options.sequential {
            self.run_sequential(array, pending, defer, options).await?;
        } else {
            self.run_parallel(array, pending, defer, options).await?;
        }

        if defer {
            self.run_batches(array, options).await?;
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        array: &ExecutionArray,
        items: Vec<ExecutionItem>,
        defer: bool,
        options: &ExecutionOptions,
    ) -> Result<()> {
        for item in items {
            if defer && item.is_extrinsic() {
                continue;
            }
            array.wait_until_resumed().await;
            if !still_pending(array, &item.id) {
                continue;
            }

            array.set_current_index(Some(item.index))?;
            let outcome = match &item.payload {
                ItemPayload::Extrinsic { call, signer } => {
                    self.run_extrinsic(array, &item, call, signer, options, false).await
                }
                _ => complete_local(array, &item),
            };
            absorb(outcome, options)?;
        }
        Ok(())
    }

    /// Non-extrinsics fan out concurrently, extrinsics then run in order
    async fn run_parallel(
        &self,
        array: &Arc<ExecutionArray>,
        items: Vec<ExecutionItem>,
        defer: bool,
        options: &ExecutionOptions,
    ) -> Result<()> {
        let (extrinsics, local): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| item.is_extrinsic());

        if !local.is_empty() {
            array.wait_until_resumed().await;

            let mut tasks = JoinSet::new();
            for item in local {
                let array = array.clone();
                tasks.spawn(async move { complete_local(&array, &item) });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.map_err(|e| ExecutorError::Internal(format!("item task failed: {}", e)))?;
                if let Err(e) = absorb(outcome, options) {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        self.run_sequential(array, extrinsics, defer, options).await
    }

    async fn run_batches(&self, array: &ExecutionArray, options: &ExecutionOptions) -> Result<()> {
        let pending: Vec<ExecutionItem> = array
            .ready_items()
            .into_iter()
            .filter(|item| item.is_extrinsic())
            .collect();

        for chunk in batch_chunks(pending, options.max_batch_size) {
            array.wait_until_resumed().await;

            let outcome = match chunk.as_slice() {
                [single] => {
                    if !still_pending(array, &single.id) {
                        continue;
                    }
                    array.set_current_index(Some(single.index))?;
                    match single.extrinsic() {
                        Some((call, signer)) => {
                            self.run_extrinsic(array, single, call, signer, options, false).await
                        }
                        None => complete_local(array, single),
                    }
                }
                members => self.run_batch(array, members, options).await,
            };
            absorb(outcome, options)?;
        }
        Ok(())
    }

    /// Submit `items` as one `batch_all`, falling back to individual runs
    async fn run_batch(&self, array: &ExecutionArray, items: &[ExecutionItem], options: &ExecutionOptions) -> Result<()> {
        let members: Vec<(&ExecutionItem, &ChainCall, &AccountId)> = items
            .iter()
            .filter_map(|item| item.extrinsic().map(|(call, signer)| (item, call, signer)))
            .collect();
        let Some(&(first, _, signer)) = members.first() else {
            return Ok(());
        };
        let ids: Vec<String> = members.iter().map(|(item, _, _)| item.id.clone()).collect();
        let calls: Vec<ChainCall> = members.iter().map(|(_, call, _)| (*call).clone()).collect();

        array.set_current_index(Some(first.index))?;
        for id in &ids {
            array.advance(id, ExecutionStatus::Signing)?;
        }

        if !options.auto_approve {
            let prompt = ApprovalPrompt::Batch(BatchSigningRequest {
                request_id: Uuid::new_v4(),
                execution_id: array.execution_id(),
                item_ids: ids.clone(),
                calls: calls.clone(),
                descriptions: items.iter().map(|item| item.description.clone()).collect(),
                total_estimated_fee: items.iter().map(|item| item.estimated_fee).sum(),
                warnings: utils::dedup_warnings(items.iter().flat_map(|item| item.warnings.iter())),
                signer: signer.clone(),
            });

            match self.approve(prompt, options).await {
                Ok(SigningDecision::Approve) => {}
                Ok(SigningDecision::Reject { reason }) => {
                    let reason = rejection_reason(reason);
                    for id in &ids {
                        array.finish(id, ExecutionStatus::Cancelled, ExecutionResult::failure(reason.clone()))?;
                    }
                    info!(items = ids.len(), "Batch rejected by user");
                    return Err(ExecutorError::ItemCancelled {
                        item_id: ids.join(","),
                        reason,
                    });
                }
                Err(e) => {
                    abandon(array, &ids, &e.to_string())?;
                    return Err(e);
                }
            }
        }

        let batch = ChainCall::Batch { calls };
        info!(items = ids.len(), signer = %signer, "Submitting batch");

        let failure = match self.signer.sign(signer, &batch).await {
            Err(e) => format!("Signing failed: {}", e),
            Ok(signed) => {
                for id in &ids {
                    array.advance(id, ExecutionStatus::Broadcasting)?;
                }
                let tx_hash = signed.hash();
                match self.broadcast(signed, options.timeout()).await {
                    Ok(inclusion) => match inclusion.dispatch_error {
                        None => {
                            for id in &ids {
                                array.finish(
                                    id,
                                    ExecutionStatus::Finalized,
                                    ExecutionResult::finalized(tx_hash, inclusion.block_hash, inclusion.events.clone()),
                                )?;
                            }
                            info!(tx_hash = %tx_hash, items = ids.len(), "Batch finalized");
                            return Ok(());
                        }
                        Some(err) => format!("Batch dispatch failed: {}", err),
                    },
                    Err(BroadcastFailure::Rejected(reason)) => reason,
                    Err(BroadcastFailure::Transport(e)) => {
                        abandon(array, &ids, &e.to_string())?;
                        return Err(e);
                    }
                }
            }
        };

        warn!(reason = %failure, items = ids.len(), "Batch failed, falling back to individual execution");
        for (position, (item, call, signer)) in members.iter().enumerate() {
            array.wait_until_resumed().await;
            array.set_current_index(Some(item.index))?;

            let outcome = self.run_extrinsic(array, item, call, signer, options, true).await;
            if let Err(e) = absorb(outcome, options) {
                let rest: Vec<String> = ids[position + 1..].to_vec();
                abandon(array, &rest, &format!("Skipped after {} failed", item.id))?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Approve, sign, submit and await finality for one extrinsic
    async fn run_extrinsic(
        &self,
        array: &ExecutionArray,
        item: &ExecutionItem,
        call: &ChainCall,
        signer: &AccountId,
        options: &ExecutionOptions,
        preapproved: bool,
    ) -> Result<()> {
        let id = item.id.as_str();
        array.advance(id, ExecutionStatus::Signing)?;

        if !preapproved {
            let prompt = ApprovalPrompt::Single(SigningRequest {
                request_id: Uuid::new_v4(),
                execution_id: array.execution_id(),
                item_id: item.id.clone(),
                call: call.clone(),
                description: item.description.clone(),
                estimated_fee: item.estimated_fee,
                warnings: item.warnings.clone(),
                signer: signer.clone(),
            });

            match self.approve(prompt, options).await {
                Ok(SigningDecision::Approve) => {}
                Ok(SigningDecision::Reject { reason }) => {
                    let reason = rejection_reason(reason);
                    array.finish(id, ExecutionStatus::Cancelled, ExecutionResult::failure(reason.clone()))?;
                    info!(item_id = %id, index = item.index, "Signing rejected");
                    return Err(ExecutorError::ItemCancelled {
                        item_id: item.id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    abandon(array, &[item.id.clone()], &e.to_string())?;
                    return Err(e);
                }
            }
        }

        let signed = match self.signer.sign(signer, call).await {
            Ok(signed) => signed,
            Err(e) => return fail(array, id, format!("Signing failed: {}", e)),
        };

        array.advance(id, ExecutionStatus::Broadcasting)?;
        let tx_hash = signed.hash();
        debug!(item_id = %id, tx_hash = %tx_hash, call = call.label(), "Broadcasting");

        match self.broadcast(signed, options.timeout()).await {
            Ok(inclusion) => record_inclusion(array, id, tx_hash, inclusion),
            Err(BroadcastFailure::Rejected(reason)) => fail(array, id, reason),
            Err(BroadcastFailure::Transport(e)) => {
                abandon(array, &[item.id.clone()], &e.to_string())?;
                Err(e)
            }
        }
    }

    async fn approve(&self, prompt: ApprovalPrompt, options: &ExecutionOptions) -> Result<SigningDecision> {
        if options.auto_approve {
            return Ok(SigningDecision::Approve);
        }
        match &self.approvals {
            Some(queue) => queue.request(prompt).await,
            None => Err(ExecutorError::Config("no signing approval handler registered".to_string())),
        }
    }

    async fn broadcast(
        &self,
        signed: SignedPayload,
        timeout: Duration,
    ) -> std::result::Result<BlockInclusion, BroadcastFailure> {
        let tx_hash = signed.hash();
        let mut watch = self.chain.submit(signed).await.map_err(|e| match e {
            ChainError::Connection(message) => BroadcastFailure::Transport(ExecutorError::Transport(message)),
            other => BroadcastFailure::Rejected(format!("Transaction rejected: {}", other)),
        })?;

        let finality = async {
            while let Some(status) = watch.recv().await {
                match status {
                    TxStatus::InBlock(inclusion) => {
                        debug!(tx_hash = %tx_hash, block = %inclusion.block_hash, "Transaction in block")
                    }
                    TxStatus::Finalized(inclusion) => return Ok(inclusion),
                    TxStatus::Dropped { reason } => {
                        return Err(BroadcastFailure::Rejected(format!("Transaction dropped: {}", reason)))
                    }
                    TxStatus::Invalid { reason } => {
                        return Err(BroadcastFailure::Rejected(format!("Transaction invalid: {}", reason)))
                    }
                }
            }
            Err(BroadcastFailure::Transport(ExecutorError::Transport(format!(
                "status stream for {} closed before finality",
                tx_hash
            ))))
        };

        match tokio::time::timeout(timeout, finality).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BroadcastFailure::Transport(ExecutorError::Timeout {
                operation: format!("finality of {}", tx_hash),
            })),
        }
    }
}

/// Resets run state and fires the completion event on every exit path
struct RunGuard<'a> {
    array: &'a ExecutionArray,
    outcome: Option<(bool, Option<String>)>,
}

impl<'a> RunGuard<'a> {
    fn new(array: &'a ExecutionArray) -> Self {
        Self { array, outcome: None }
    }

    fn finish(&mut self, result: &Result<()>) {
        let state = self.array.snapshot();
        let success = result.is_ok() && state.failed_items == 0 && state.cancelled_items == 0;
        self.outcome = Some((success, result.as_ref().err().map(|e| e.to_string())));
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.array.set_current_index(None) {
            warn!(error = %e, "Failed to clear current index");
        }
        if let Err(e) = self.array.set_executing(false) {
            warn!(error = %e, "Failed to clear executing flag");
        }
        let (success, error) = self
            .outcome
            .take()
            .unwrap_or_else(|| (false, Some("execution was interrupted".to_string())));
        self.array.notify_completed(success, error);
    }
}

/// Complete a data_fetch, validation or user_input item
fn complete_local(array: &ExecutionArray, item: &ExecutionItem) -> Result<()> {
    match &item.payload {
        ItemPayload::DataFetch { data } => {
            array.finish(&item.id, ExecutionStatus::Completed, ExecutionResult::with_data(data.clone()))
        }
        ItemPayload::Validation { passed: true, data } => {
            array.finish(&item.id, ExecutionStatus::Completed, ExecutionResult::with_data(data.clone()))
        }
        ItemPayload::Validation { passed: false, data } => {
            let reason = match data.get("reason").and_then(|r| r.as_str()) {
                Some(detail) => format!("Validation failed: {}", detail),
                None => "Validation failed".to_string(),
            };
            let mut result = ExecutionResult::failure(reason.clone());
            result.data = Some(data.clone());
            array.finish(&item.id, ExecutionStatus::Failed, result)?;
            Err(ExecutorError::ItemFailed {
                item_id: item.id.clone(),
                reason,
            })
        }
        ItemPayload::UserInput { value: Some(value), .. } => {
            array.finish(&item.id, ExecutionStatus::Completed, ExecutionResult::with_data(value.clone()))
        }
        ItemPayload::UserInput { value: None, .. } => {
            array.advance(&item.id, ExecutionStatus::Ready)?;
            info!(item_id = %item.id, "Waiting for user input");
            Ok(())
        }
        ItemPayload::Extrinsic { .. } => Err(ExecutorError::Internal(format!(
            "extrinsic {} cannot complete locally",
            item.id
        ))),
    }
}

fn record_inclusion(array: &ExecutionArray, id: &str, tx_hash: TxHash, inclusion: BlockInclusion) -> Result<()> {
    match inclusion.dispatch_error {
        None => {
            info!(item_id = %id, tx_hash = %tx_hash, block = %inclusion.block_hash, "Extrinsic finalized");
            array.finish(
                id,
                ExecutionStatus::Finalized,
                ExecutionResult::finalized(tx_hash, inclusion.block_hash, inclusion.events),
            )
        }
        Some(err) => {
            let reason = err.to_string();
            warn!(item_id = %id, tx_hash = %tx_hash, error = %reason, "Extrinsic failed on chain");
            let result = ExecutionResult {
                success: false,
                tx_hash: Some(tx_hash),
                block_hash: Some(inclusion.block_hash),
                events: inclusion.events,
                data: None,
                error: Some(reason.clone()),
            };
            array.finish(id, ExecutionStatus::Failed, result)?;
            Err(ExecutorError::ItemFailed {
                item_id: id.to_string(),
                reason,
            })
        }
    }
}

fn fail(array: &ExecutionArray, id: &str, reason: String) -> Result<()> {
    warn!(item_id = %id, error = %reason, "Item failed");
    array.finish(id, ExecutionStatus::Failed, ExecutionResult::failure(reason.clone()))?;
    Err(ExecutorError::ItemFailed {
        item_id: id.to_string(),
        reason,
    })
}

/// Fail items that were started but will not be finished by this run
fn abandon(array: &ExecutionArray, ids: &[String], reason: &str) -> Result<()> {
    for id in ids {
        let started = array
            .item(id)
            .map(|item| item.status != ExecutionStatus::Pending && !item.status.is_terminal())
            .unwrap_or(false);
        if started {
            array.finish(id, ExecutionStatus::Failed, ExecutionResult::failure(reason))?;
        }
    }
    Ok(())
}

fn rejection_reason(reason: Option<String>) -> String {
    match reason {
        Some(reason) if reason == DROPPED_REASON => reason,
        Some(reason) if !reason.trim().is_empty() => format!("User rejected: {}", reason),
        _ => "User rejected".to_string(),
    }
}

fn still_pending(array: &ExecutionArray, id: &str) -> bool {
    array
        .item(id)
        .map(|item| item.status == ExecutionStatus::Pending)
        .unwrap_or(false)
}

/// Swallow per-item failures when the run continues past them
fn absorb(outcome: Result<()>, options: &ExecutionOptions) -> Result<()> {
    match outcome {
        Err(e @ (ExecutorError::ItemFailed { .. } | ExecutorError::ItemCancelled { .. }))
            if options.continue_on_error =>
        {
            debug!(error = %e, "Continuing after item failure");
            Ok(())
        }
        other => other,
    }
}

/// Consecutive runs of one signer, split at `max_batch_size`
fn batch_chunks(items: Vec<ExecutionItem>, max_batch_size: usize) -> Vec<Vec<ExecutionItem>> {
    let limit = max_batch_size.max(2);
    let mut chunks: Vec<Vec<ExecutionItem>> = Vec::new();

    for item in items {
        let signer = item.extrinsic().map(|(_, signer)| signer.clone());
        let joins_last = chunks.last().map_or(false, |chunk| {
            chunk.len() < limit
                && chunk
                    .first()
                    .and_then(|head| head.extrinsic())
                    .map(|(_, head_signer)| Some(head_signer) == signer.as_ref())
                    .unwrap_or(false)
        });

        match chunks.last_mut() {
            Some(chunk) if joins_last => chunk.push(item),
            _ => chunks.push(vec![item]),
        }
    }
    chunks
}
