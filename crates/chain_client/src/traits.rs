//! Capability traits consumed by the simulator and the executioner

use async_trait::async_trait;
use tokio::sync::mpsc;
use types::{
    AccountId, AccountInfo, Balance, BlockHash, ChainCall, ChainError, ChainEvent, FailureReason,
    ForkError, SignedPayload, SignerError, TxStatus,
};

/// Stream of status updates for one submitted transaction
pub type TxWatch = mpsc::Receiver<TxStatus>;

/// Live chain access
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hash of the latest finalized block
    async fn finalized_block_hash(&self) -> Result<BlockHash, ChainError>;

    /// Read-only fee estimate for `call` sent by `origin`
    async fn estimate_fee(&self, origin: &AccountId, call: &ChainCall) -> Result<Balance, ChainError>;

    /// Account storage entry, at the best block when `at` is `None`
    async fn account(&self, address: &AccountId, at: Option<BlockHash>) -> Result<AccountInfo, ChainError>;

    /// Submit a signed payload and watch it through inclusion and finality
    async fn submit(&self, signed: SignedPayload) -> Result<TxWatch, ChainError>;
}

/// Outcome of dry-running one call on a fork
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunOutcome {
    /// `Err` when the call would be invalid or fail to dispatch
    pub result: Result<(), FailureReason>,
    pub events: Vec<ChainEvent>,
    /// Fee the call was charged on the fork
    pub fee: Balance,
}

impl DryRunOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Creates disposable forks of chain state
#[async_trait]
pub trait ForkProvider: Send + Sync {
    /// Fork at `at`, or at the latest available block when `None`
    async fn open(&self, at: Option<BlockHash>) -> Result<Box<dyn ForkSession>, ForkError>;
}

/// An ephemeral forked view of chain state
///
/// Effects of `dry_run` stay in the session's overlay, so later calls on the
/// same session observe earlier ones. Sessions must be closed after use;
/// `release` covers callers that are dropped before they reach `close`.
#[async_trait]
pub trait ForkSession: Send + Sync {
    /// Block the fork was taken at
    fn block_hash(&self) -> BlockHash;

    async fn dry_run(&mut self, origin: &AccountId, call: &ChainCall) -> Result<DryRunOutcome, ForkError>;

    async fn account(&self, address: &AccountId) -> Result<AccountInfo, ForkError>;

    /// Release the fork, idempotent
    async fn close(&mut self);

    /// Release the fork without awaiting, idempotent
    fn release(&mut self);
}

/// Signs calls on behalf of an account
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, address: &AccountId, call: &ChainCall) -> Result<SignedPayload, SignerError>;

    /// Name of the signer backend
    fn name(&self) -> &str;
}
