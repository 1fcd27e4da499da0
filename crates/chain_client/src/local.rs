//! In-memory development chain
//!
//! `LocalChain` is a deterministic single-node chain with balances, staking
//! and atomic batches. It produces one block per submission, keeps a bounded
//! window of historical state for forks, and can delay or stall finality so
//! the executioner's timeout paths can be exercised.

use crate::traits::{ChainClient, DryRunOutcome, ForkProvider, ForkSession, TxWatch};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::{
    AccountId, AccountInfo, Balance, BlockHash, BlockInclusion, ChainCall, ChainError, ChainEvent,
    DispatchError, FailureReason, ForkError, SignedPayload, TxHash, TxStatus, H256,
};

type Accounts = BTreeMap<AccountId, AccountInfo>;

const INABILITY_TO_PAY: &str = "Inability to pay some fees (e.g. account balance too low)";

/// Runtime parameters of the development chain
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub existential_deposit: Balance,
    /// Fee per leaf call
    pub base_fee: Balance,
    /// Number of recent blocks whose state stays queryable
    pub pruning_depth: u64,
}

impl ChainParams {
    pub fn fee_for(&self, call: &ChainCall) -> Balance {
        self.base_fee.saturating_mul(call.call_count() as Balance)
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            existential_deposit: 10,
            base_fee: 1,
            pruning_depth: 256,
        }
    }
}

/// When included blocks become final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityMode {
    /// Finalized together with inclusion
    Instant,
    /// Finalized after a fixed delay
    Delayed(Duration),
    /// Never finalized, watchers stay open
    Stalled,
}

/// Injected failures for exercising error paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// The pool rejects every `Utility.batch_all`
    RejectBatches,
    /// Submissions fail with a connection error
    Disconnected,
}

struct Block {
    number: u64,
    hash: BlockHash,
    accounts: Accounts,
}

struct ChainState {
    best: Accounts,
    /// Oldest first
    history: VecDeque<Block>,
    known: HashSet<BlockHash>,
    finalized: (u64, BlockHash),
    finality: FinalityMode,
    faults: HashSet<Fault>,
    submissions: Vec<SignedPayload>,
    stalled: Vec<mpsc::Sender<TxStatus>>,
}

impl ChainState {
    fn best_block(&self) -> Option<&Block> {
        self.history.back()
    }

    fn finalize(&mut self, number: u64, hash: BlockHash) {
        if number > self.finalized.0 {
            self.finalized = (number, hash);
        }
    }

    fn produce_block(&mut self, pruning_depth: u64, tx_hash: TxHash, applied: Applied) -> BlockInclusion {
        let (parent_number, parent_hash) = self
            .best_block()
            .map(|b| (b.number, b.hash))
            .unwrap_or((0, BlockHash::ZERO));
        let number = parent_number + 1;

        let mut seed = parent_hash.as_bytes().to_vec();
        seed.extend_from_slice(&number.to_be_bytes());
        seed.extend_from_slice(tx_hash.as_bytes());
        let hash = H256::keccak(&seed);

        self.history.push_back(Block {
            number,
            hash,
            accounts: self.best.clone(),
        });
        self.known.insert(hash);
        while self.history.len() as u64 > pruning_depth.max(1) {
            if let Some(pruned) = self.history.pop_front() {
                debug!(block = %pruned.hash, number = pruned.number, "Pruned block state");
            }
        }

        BlockInclusion {
            block_hash: hash,
            block_number: number,
            events: applied.events,
            dispatch_error: applied.dispatch_error,
        }
    }
}

/// Deterministic in-memory chain implementing every chain capability
#[derive(Clone)]
pub struct LocalChain {
    params: Arc<ChainParams>,
    state: Arc<Mutex<ChainState>>,
    open_forks: Arc<AtomicUsize>,
}

impl LocalChain {
    /// Create a chain whose genesis block holds `genesis` balances
    pub fn new<I>(params: ChainParams, genesis: I) -> Self
    where
        I: IntoIterator<Item = (AccountId, Balance)>,
    {
        let accounts: Accounts = genesis
            .into_iter()
            .map(|(address, free)| (address, AccountInfo::with_free(free)))
            .collect();
        let genesis_hash = H256::keccak(b"plan-executor/genesis");

        let mut history = VecDeque::new();
        history.push_back(Block {
            number: 0,
            hash: genesis_hash,
            accounts: accounts.clone(),
        });

        let state = ChainState {
            best: accounts,
            history,
            known: HashSet::from([genesis_hash]),
            finalized: (0, genesis_hash),
            finality: FinalityMode::Instant,
            faults: HashSet::new(),
            submissions: Vec::new(),
            stalled: Vec::new(),
        };

        Self {
            params: Arc::new(params),
            state: Arc::new(Mutex::new(state)),
            open_forks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn set_finality(&self, mode: FinalityMode) {
        self.lock().finality = mode;
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.faults.insert(fault);
        } else {
            state.faults.remove(&fault);
        }
    }

    /// Every payload accepted into a block, in submission order
    pub fn submissions(&self) -> Vec<SignedPayload> {
        self.lock().submissions.clone()
    }

    /// Fork sessions opened and not yet closed
    pub fn open_forks(&self) -> usize {
        self.open_forks.load(Ordering::SeqCst)
    }

    pub fn best_number(&self) -> u64 {
        self.lock().best_block().map(|b| b.number).unwrap_or(0)
    }

    /// Account entry at the best block
    pub fn account_now(&self, address: &AccountId) -> AccountInfo {
        self.lock().best.get(address).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChainClient for LocalChain {
    async fn finalized_block_hash(&self) -> Result<BlockHash, ChainError> {
        Ok(self.lock().finalized.1)
    }

    async fn estimate_fee(&self, _origin: &AccountId, call: &ChainCall) -> Result<Balance, ChainError> {
        Ok(self.params.fee_for(call))
    }

    async fn account(&self, address: &AccountId, at: Option<BlockHash>) -> Result<AccountInfo, ChainError> {
        let state = self.lock();
        let accounts = match at {
            None => &state.best,
            Some(hash) => match state.history.iter().find(|b| b.hash == hash) {
                Some(block) => &block.accounts,
                None => return Err(ChainError::UnknownBlock(hash)),
            },
        };
        Ok(accounts.get(address).cloned().unwrap_or_default())
    }

    async fn submit(&self, signed: SignedPayload) -> Result<TxWatch, ChainError> {
        let (tx, rx) = mpsc::channel(4);
        let tx_hash = signed.hash();

        let (inclusion, finality) = {
            let mut state = self.lock();
            if state.faults.contains(&Fault::Disconnected) {
                return Err(ChainError::Connection("local chain disconnected".to_string()));
            }
            if signed.signature.is_empty() {
                return Err(ChainError::BadSignature {
                    signer: signed.signer.to_string(),
                });
            }
            if state.faults.contains(&Fault::RejectBatches) && matches!(signed.call, ChainCall::Batch { .. }) {
                return Err(ChainError::InvalidTransaction("batch rejected by pool".to_string()));
            }

            let mut best = state.best.clone();
            let applied = apply_extrinsic(&self.params, &mut best, &signed.signer, &signed.call)
                .map_err(ChainError::InvalidTransaction)?;
            state.best = best;
            let inclusion = state.produce_block(self.params.pruning_depth, tx_hash, applied);
            state.submissions.push(signed);
            (inclusion, state.finality)
        };

        info!(
            tx_hash = %tx_hash,
            block = %inclusion.block_hash,
            number = inclusion.block_number,
            failed = inclusion.dispatch_error.is_some(),
            "Transaction included"
        );

        // Fresh channel with spare capacity
        let _ = tx.try_send(TxStatus::InBlock(inclusion.clone()));

        match finality {
            FinalityMode::Instant => {
                self.lock().finalize(inclusion.block_number, inclusion.block_hash);
                let _ = tx.try_send(TxStatus::Finalized(inclusion));
            }
            FinalityMode::Delayed(delay) => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .finalize(inclusion.block_number, inclusion.block_hash);
                    let _ = tx.send(TxStatus::Finalized(inclusion)).await;
                });
            }
            FinalityMode::Stalled => {
                self.lock().stalled.push(tx);
            }
        }

        Ok(rx)
    }
}

#[async_trait]
impl ForkProvider for LocalChain {
    async fn open(&self, at: Option<BlockHash>) -> Result<Box<dyn ForkSession>, ForkError> {
        let (block_hash, overlay) = {
            let state = self.lock();
            let block = match at {
                None => state.best_block(),
                Some(hash) => {
                    let found = state.history.iter().find(|b| b.hash == hash);
                    if found.is_none() && state.known.contains(&hash) {
                        return Err(ForkError::BlockPruned { block: hash });
                    }
                    found
                }
            };
            match block {
                Some(block) => (block.hash, block.accounts.clone()),
                None => {
                    return Err(ForkError::SetupFailed(format!(
                        "no state available at {}",
                        at.map(|h| h.to_string()).unwrap_or_else(|| "latest".to_string())
                    )))
                }
            }
        };

        let open = self.open_forks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(block = %block_hash, open_forks = open, "Opened fork session");

        Ok(Box::new(LocalFork {
            params: self.params.clone(),
            block_hash,
            overlay,
            open_forks: self.open_forks.clone(),
            closed: false,
        }))
    }
}

/// Fork of a `LocalChain`, effects kept in a private overlay
pub struct LocalFork {
    params: Arc<ChainParams>,
    block_hash: BlockHash,
    overlay: Accounts,
    open_forks: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl ForkSession for LocalFork {
    fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    async fn dry_run(&mut self, origin: &AccountId, call: &ChainCall) -> Result<DryRunOutcome, ForkError> {
        if self.closed {
            return Err(ForkError::Closed);
        }

        let outcome = match apply_extrinsic(&self.params, &mut self.overlay, origin, call) {
            Ok(applied) => DryRunOutcome {
                result: match applied.dispatch_error {
                    None => Ok(()),
                    Some(err) => Err(FailureReason::Dispatch(err)),
                },
                events: applied.events,
                fee: applied.fee,
            },
            Err(reason) => DryRunOutcome {
                result: Err(FailureReason::Invalid { reason }),
                events: Vec::new(),
                fee: 0,
            },
        };
        Ok(outcome)
    }

    async fn account(&self, address: &AccountId) -> Result<AccountInfo, ForkError> {
        if self.closed {
            return Err(ForkError::Closed);
        }
        Ok(self.overlay.get(address).cloned().unwrap_or_default())
    }

    async fn close(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_forks.fetch_sub(1, Ordering::SeqCst);
            debug!(block = %self.block_hash, "Closed fork session");
        }
    }
}

impl Drop for LocalFork {
    fn drop(&mut self) {
        if !self.closed {
            warn!(block = %self.block_hash, "Fork session dropped without close");
            self.release();
        }
    }
}

/// Result of applying an extrinsic that passed validity checks
struct Applied {
    fee: Balance,
    events: Vec<ChainEvent>,
    dispatch_error: Option<DispatchError>,
}

/// State transition for one extrinsic
///
/// `Err` means the transaction is invalid and nothing was applied. A dispatch
/// failure still charges the fee and bumps the nonce.
fn apply_extrinsic(
    params: &ChainParams,
    accounts: &mut Accounts,
    origin: &AccountId,
    call: &ChainCall,
) -> Result<Applied, String> {
    let fee = params.fee_for(call);
    let payer = accounts
        .get_mut(origin)
        .ok_or_else(|| INABILITY_TO_PAY.to_string())?;
    if payer.free < fee {
        return Err(INABILITY_TO_PAY.to_string());
    }
    payer.free -= fee;
    payer.nonce += 1;

    let mut events = vec![ChainEvent::new(
        "TransactionPayment",
        "TransactionFeePaid",
        json!({ "who": origin, "actualFee": fee.to_string() }),
    )];

    let mut working = accounts.clone();
    let mut call_events = Vec::new();
    let dispatch_error = match dispatch(params, &mut working, origin, call, &mut call_events) {
        Ok(()) => {
            *accounts = working;
            events.extend(call_events);
            events.push(ChainEvent::new("System", "ExtrinsicSuccess", json!({})));
            None
        }
        Err(err) => {
            events.push(ChainEvent::new(
                "System",
                "ExtrinsicFailed",
                json!({ "dispatchError": err.to_string() }),
            ));
            Some(err)
        }
    };

    Ok(Applied {
        fee,
        events,
        dispatch_error,
    })
}

fn dispatch(
    params: &ChainParams,
    accounts: &mut Accounts,
    origin: &AccountId,
    call: &ChainCall,
    events: &mut Vec<ChainEvent>,
) -> Result<(), DispatchError> {
    match call {
        ChainCall::Transfer { dest, amount } => {
            let sender = accounts.get(origin).cloned().unwrap_or_default();
            if sender.free < *amount {
                return Err(DispatchError::new("Balances", "InsufficientBalance"));
            }
            if origin != dest && sender.free - amount < params.existential_deposit {
                return Err(DispatchError::new("Balances", "KeepAlive"));
            }
            let receiver = accounts.get(dest).cloned().unwrap_or_default();
            if receiver.total().saturating_add(*amount) < params.existential_deposit {
                return Err(DispatchError::new("Balances", "ExistentialDeposit"));
            }

            accounts.entry(origin.clone()).or_default().free -= amount;
            let entry = accounts.entry(dest.clone()).or_default();
            entry.free = entry.free.saturating_add(*amount);
            events.push(ChainEvent::new(
                "Balances",
                "Transfer",
                json!({ "from": origin, "to": dest, "amount": amount.to_string() }),
            ));
        }
        ChainCall::Bond { amount } => {
            if *amount == 0 {
                return Err(DispatchError::new("Staking", "InsufficientBond"));
            }
            let stash = accounts.entry(origin.clone()).or_default();
            if stash.free < *amount {
                return Err(DispatchError::new("Balances", "InsufficientBalance"));
            }
            stash.free -= amount;
            stash.bonded = stash.bonded.saturating_add(*amount);
            events.push(ChainEvent::new(
                "Staking",
                "Bonded",
                json!({ "stash": origin, "amount": amount.to_string() }),
            ));
        }
        ChainCall::Unbond { amount } => {
            let stash = accounts.entry(origin.clone()).or_default();
            if stash.bonded < *amount {
                return Err(DispatchError::new("Staking", "InsufficientBond"));
            }
            stash.bonded -= amount;
            stash.free = stash.free.saturating_add(*amount);
            events.push(ChainEvent::new(
                "Staking",
                "Unbonded",
                json!({ "stash": origin, "amount": amount.to_string() }),
            ));
        }
        ChainCall::Remark { data } => {
            events.push(ChainEvent::new(
                "System",
                "Remarked",
                json!({ "sender": origin, "hash": H256::keccak(data.as_bytes()) }),
            ));
        }
        ChainCall::Batch { calls } => {
            // Caller discards the working state on error, making the batch atomic
            for (index, inner) in calls.iter().enumerate() {
                dispatch(params, accounts, origin, inner, events).map_err(|err| {
                    debug!(index, error = %err, "Batch member failed");
                    err
                })?;
            }
            events.push(ChainEvent::new(
                "Utility",
                "BatchCompleted",
                json!({ "calls": calls.len() }),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(balance: Balance) -> LocalChain {
        LocalChain::new(ChainParams::default(), vec![(AccountId::from("alice"), balance)])
    }

    fn signed(signer: &str, call: ChainCall) -> SignedPayload {
        SignedPayload {
            signer: signer.into(),
            call,
            signature: "0x01".to_string(),
        }
    }

    fn transfer(dest: &str, amount: Balance) -> ChainCall {
        ChainCall::Transfer {
            dest: dest.into(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_transfer_is_included_and_finalized() {
        let chain = chain(1_000);
        let mut watch = chain.submit(signed("alice", transfer("bob", 100))).await.unwrap();

        let in_block = watch.recv().await.unwrap();
        assert!(matches!(in_block, TxStatus::InBlock(_)));
        match watch.recv().await.unwrap() {
            TxStatus::Finalized(inclusion) => {
                assert!(inclusion.dispatch_error.is_none());
                assert_eq!(chain.finalized_block_hash().await.unwrap(), inclusion.block_hash);
            }
            other => panic!("unexpected status {:?}", other),
        }

        assert_eq!(chain.account_now(&"alice".into()).free, 899);
        assert_eq!(chain.account_now(&"bob".into()).free, 100);
        assert_eq!(chain.best_number(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_still_charges_fee() {
        let chain = chain(50);
        let mut watch = chain.submit(signed("alice", transfer("bob", 100))).await.unwrap();

        match watch.recv().await.unwrap() {
            TxStatus::InBlock(inclusion) => {
                assert_eq!(
                    inclusion.dispatch_error,
                    Some(DispatchError::new("Balances", "InsufficientBalance"))
                );
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(chain.account_now(&"alice".into()).free, 49);
        assert_eq!(chain.account_now(&"alice".into()).nonce, 1);
    }

    #[tokio::test]
    async fn test_unknown_origin_is_invalid() {
        let chain = chain(50);
        let err = chain.submit(signed("mallory", transfer("bob", 1))).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let chain = chain(200);
        let batch = ChainCall::Batch {
            calls: vec![transfer("bob", 50), ChainCall::Bond { amount: 500 }],
        };
        let mut watch = chain.submit(signed("alice", batch)).await.unwrap();

        match watch.recv().await.unwrap() {
            TxStatus::InBlock(inclusion) => assert!(inclusion.dispatch_error.is_some()),
            other => panic!("unexpected status {:?}", other),
        }
        // two leaf calls, fee 2, transfer rolled back
        assert_eq!(chain.account_now(&"alice".into()).free, 198);
        assert_eq!(chain.account_now(&"bob".into()).free, 0);
    }

    #[tokio::test]
    async fn test_fork_overlay_is_isolated_and_threaded() {
        let chain = chain(120);
        let mut fork = chain.open(None).await.unwrap();
        assert_eq!(chain.open_forks(), 1);

        let first = fork.dry_run(&"alice".into(), &transfer("bob", 100)).await.unwrap();
        assert!(first.is_ok());
        let second = fork
            .dry_run(&"alice".into(), &ChainCall::Bond { amount: 50 })
            .await
            .unwrap();
        assert_eq!(
            second.result,
            Err(FailureReason::Dispatch(DispatchError::new("Balances", "InsufficientBalance")))
        );

        assert_eq!(fork.account(&"alice".into()).await.unwrap().free, 18);
        assert_eq!(chain.account_now(&"alice".into()).free, 120);

        fork.close().await;
        fork.close().await;
        assert_eq!(chain.open_forks(), 0);
        assert!(matches!(
            fork.dry_run(&"alice".into(), &transfer("bob", 1)).await,
            Err(ForkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_pruned_fork_point() {
        let params = ChainParams {
            pruning_depth: 1,
            ..Default::default()
        };
        let chain = LocalChain::new(params, vec![(AccountId::from("alice"), 1_000)]);
        let genesis = chain.finalized_block_hash().await.unwrap();

        chain.submit(signed("alice", transfer("bob", 100))).await.unwrap();

        let err = chain.open(Some(genesis)).await.err().unwrap();
        assert!(matches!(err, ForkError::BlockPruned { .. }));
        assert!(chain.account(&"alice".into(), Some(genesis)).await.is_err());

        let mut fork = chain.open(None).await.unwrap();
        fork.close().await;
        assert_eq!(chain.open_forks(), 0);
    }

    #[tokio::test]
    async fn test_dropped_fork_is_released() {
        let chain = chain(1_000);
        let mut fork = chain.open(None).await.unwrap();
        let other = chain.open(None).await.unwrap();
        assert_eq!(chain.open_forks(), 2);

        fork.release();
        fork.release();
        assert_eq!(chain.open_forks(), 1);
        assert!(matches!(fork.account(&"alice".into()).await, Err(ForkError::Closed)));

        drop(other);
        drop(fork);
        assert_eq!(chain.open_forks(), 0);
    }

    #[tokio::test]
    async fn test_stalled_finality_keeps_watch_open() {
        let chain = chain(1_000);
        chain.set_finality(FinalityMode::Stalled);
        let mut watch = chain.submit(signed("alice", transfer("bob", 100))).await.unwrap();

        assert!(matches!(watch.recv().await, Some(TxStatus::InBlock(_))));
        let next = tokio::time::timeout(Duration::from_millis(50), watch.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_delayed_finality() {
        let chain = chain(1_000);
        chain.set_finality(FinalityMode::Delayed(Duration::from_millis(20)));
        let genesis = chain.finalized_block_hash().await.unwrap();
        let mut watch = chain.submit(signed("alice", transfer("bob", 100))).await.unwrap();

        assert!(matches!(watch.recv().await, Some(TxStatus::InBlock(_))));
        assert_eq!(chain.finalized_block_hash().await.unwrap(), genesis);
        assert!(matches!(watch.recv().await, Some(TxStatus::Finalized(_))));
        assert_ne!(chain.finalized_block_hash().await.unwrap(), genesis);
    }

    #[tokio::test]
    async fn test_faults() {
        let chain = chain(1_000);
        chain.set_fault(Fault::Disconnected, true);
        let err = chain.submit(signed("alice", transfer("bob", 1))).await.unwrap_err();
        assert!(matches!(err, ChainError::Connection(_)));

        chain.set_fault(Fault::Disconnected, false);
        chain.set_fault(Fault::RejectBatches, true);
        let batch = ChainCall::Batch {
            calls: vec![transfer("bob", 1), transfer("bob", 2)],
        };
        assert!(chain.submit(signed("alice", batch)).await.is_err());
        assert!(chain.submit(signed("alice", transfer("bob", 1))).await.is_ok());
    }
}
