//! Fork-based simulation engine

use crate::traits::SimulationEngine;
use async_trait::async_trait;
use chain_client::{ChainClient, ForkProvider, ForkSession};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::{
    net_balance_deltas, AccountId, Balance, BalanceDelta, BlockHash, ChainCall, Confidence,
    ForkError, Result, SequentialSimulationResult, SimulationResult, SimulationStep,
};

/// Simulator tuning
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// How long a resolved finalized hash is reused as the fork point
    pub fork_point_ttl: Duration,
    /// Retry at the fork's latest block when the fork point was pruned
    pub retry_pruned_with_latest: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            fork_point_ttl: Duration::from_secs(6),
            retry_pruned_with_latest: true,
        }
    }
}

/// Owns an open fork until it is closed
///
/// A simulation future dropped mid dry-run never reaches `close`, so `Drop`
/// releases whatever session is still held.
struct ForkGuard {
    session: Option<Box<dyn ForkSession>>,
}

impl ForkGuard {
    fn new(session: Box<dyn ForkSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn session(&mut self) -> Result<&mut dyn ForkSession> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(ForkError::Closed.into()),
        }
    }

    async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for ForkGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(block = %session.block_hash(), "Simulation abandoned, releasing fork");
            session.release();
        }
    }
}

/// A fork session plus how it was obtained
struct OpenedFork {
    guard: ForkGuard,
    confidence: Confidence,
    warnings: Vec<String>,
}

/// Simulates calls on disposable forks of the live chain
///
/// Every call opens its own fork, so concurrent simulations never share
/// one. Only the fork point (a finalized block hash) is cached.
pub struct ForkSimulator {
    chain: Arc<dyn ChainClient>,
    forks: Arc<dyn ForkProvider>,
    settings: SimulatorSettings,
    fork_point: Mutex<Option<(BlockHash, Instant)>>,
}

impl ForkSimulator {
    pub fn new(chain: Arc<dyn ChainClient>, forks: Arc<dyn ForkProvider>, settings: SimulatorSettings) -> Self {
        Self {
            chain,
            forks,
            settings,
            fork_point: Mutex::new(None),
        }
    }

    /// Finalized block to fork at, cached for the configured TTL
    async fn fork_point(&self) -> Result<BlockHash> {
        let cached = *self.cached_fork_point();
        if let Some((hash, at)) = cached {
            if at.elapsed() < self.settings.fork_point_ttl {
                return Ok(hash);
            }
        }

        let hash = self.chain.finalized_block_hash().await?;
        *self.cached_fork_point() = Some((hash, Instant::now()));
        Ok(hash)
    }

    fn cached_fork_point(&self) -> std::sync::MutexGuard<'_, Option<(BlockHash, Instant)>> {
        self.fork_point.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_fork(&self) -> Result<OpenedFork> {
        let at = self.fork_point().await?;

        match self.forks.open(Some(at)).await {
            Ok(session) => Ok(OpenedFork {
                guard: ForkGuard::new(session),
                confidence: Confidence::Full,
                warnings: Vec::new(),
            }),
            Err(ForkError::BlockPruned { block }) if self.settings.retry_pruned_with_latest => {
                warn!(block = %block, "Fork point pruned, retrying at latest block");
                *self.cached_fork_point() = None;

                let session = self.forks.open(None).await?;
                let warning = format!(
                    "Block {} is no longer available; simulated against block {} instead",
                    block,
                    session.block_hash()
                );
                Ok(OpenedFork {
                    guard: ForkGuard::new(session),
                    confidence: Confidence::Reduced,
                    warnings: vec![warning],
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dry-run one call on an open fork
    async fn run_step(
        &self,
        fork: &mut dyn ForkSession,
        origin: &AccountId,
        call: &ChainCall,
        confidence: Confidence,
        warnings: &[String],
    ) -> Result<SimulationResult> {
        let estimated_fee = self.chain.estimate_fee(origin, call).await?;

        let mut touched = vec![origin.clone()];
        for account in call.counterparties() {
            if !touched.contains(&account) {
                touched.push(account);
            }
        }

        let mut before = Vec::with_capacity(touched.len());
        for account in &touched {
            before.push(fork.account(account).await?.free);
        }

        let outcome = fork.dry_run(origin, call).await?;

        let mut balance_deltas = Vec::new();
        for (account, before) in touched.into_iter().zip(before) {
            let after = fork.account(&account).await?.free;
            if let Some(delta) = BalanceDelta::between(account, before, after) {
                balance_deltas.push(delta);
            }
        }

        let success = outcome.is_ok();
        debug!(
            origin = %origin,
            call = call.label(),
            success,
            fee = %estimated_fee,
            "Dry-run complete"
        );

        Ok(SimulationResult {
            success,
            failure: outcome.result.err(),
            estimated_fee,
            balance_deltas,
            events: outcome.events,
            block_hash: fork.block_hash(),
            confidence,
            warnings: warnings.to_vec(),
        })
    }

    async fn run_sequence(
        &self,
        fork: &mut dyn ForkSession,
        steps: &[SimulationStep],
        confidence: Confidence,
        warnings: &[String],
    ) -> Result<SequentialSimulationResult> {
        let mut results = Vec::with_capacity(steps.len());
        let mut failed_step = None;
        let mut failure = None;

        for (index, step) in steps.iter().enumerate() {
            let result = self
                .run_step(fork, &step.origin, &step.call, confidence, &[])
                .await?;
            let success = result.success;
            if !success {
                failed_step = Some(index);
                failure = result.failure.clone();
            }
            results.push(result);
            if !success {
                break;
            }
        }

        let completed = results.iter().filter(|r| r.success);
        let cumulative_fee: Balance = completed.clone().map(|r| r.estimated_fee).sum();
        let net = net_balance_deltas(completed.flat_map(|r| r.balance_deltas.iter()));

        Ok(SequentialSimulationResult {
            success: failed_step.is_none(),
            steps: results,
            failed_step,
            failure,
            cumulative_fee,
            net_balance_deltas: net,
            block_hash: fork.block_hash(),
            confidence,
            warnings: warnings.to_vec(),
        })
    }
}

#[async_trait]
impl SimulationEngine for ForkSimulator {
    async fn simulate(&self, origin: &AccountId, call: &ChainCall) -> Result<SimulationResult> {
        let mut fork = self.open_fork().await?;

        let result = match fork.guard.session() {
            Ok(session) => {
                self.run_step(session, origin, call, fork.confidence, &fork.warnings)
                    .await
            }
            Err(e) => Err(e),
        };
        fork.guard.close().await;

        if let Ok(ref simulation) = result {
            info!(
                origin = %origin,
                call = call.label(),
                success = simulation.success,
                "Simulated call"
            );
        }
        result
    }

    async fn simulate_sequence(&self, steps: &[SimulationStep]) -> Result<SequentialSimulationResult> {
        let mut fork = self.open_fork().await?;

        let result = match fork.guard.session() {
            Ok(session) => {
                self.run_sequence(session, steps, fork.confidence, &fork.warnings)
                    .await
            }
            Err(e) => Err(e),
        };
        fork.guard.close().await;

        if let Ok(ref simulation) = result {
            info!(
                steps = steps.len(),
                success = simulation.success,
                failed_step = ?simulation.failed_step,
                "Simulated call sequence"
            );
        }
        result
    }

    fn name(&self) -> &str {
        "fork"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_client::{ChainParams, DryRunOutcome, LocalChain};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use types::{
        AccountInfo, BalanceDirection, DispatchError, ExecutorError, FailureReason, SignedPayload,
    };

    fn setup(balance: Balance, params: ChainParams, settings: SimulatorSettings) -> (LocalChain, ForkSimulator) {
        let chain = LocalChain::new(params, vec![(AccountId::from("alice"), balance)]);
        let simulator = ForkSimulator::new(Arc::new(chain.clone()), Arc::new(chain.clone()), settings);
        (chain, simulator)
    }

    fn transfer(amount: Balance) -> ChainCall {
        ChainCall::Transfer {
            dest: "bob".into(),
            amount,
        }
    }

    fn step(call: ChainCall) -> SimulationStep {
        SimulationStep::new("alice".into(), call)
    }

    #[tokio::test]
    async fn test_simulate_transfer() {
        let (chain, simulator) = setup(1_000, ChainParams::default(), SimulatorSettings::default());

        let result = simulator.simulate(&"alice".into(), &transfer(100)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.estimated_fee, 1);
        assert_eq!(result.confidence, Confidence::Full);
        assert_eq!(result.balance_deltas.len(), 2);
        assert_eq!(result.balance_deltas[0].amount, 101);
        assert_eq!(result.balance_deltas[0].direction, BalanceDirection::Debit);
        assert_eq!(result.balance_deltas[1].amount, 100);
        assert_eq!(result.balance_deltas[1].direction, BalanceDirection::Credit);

        assert_eq!(chain.open_forks(), 0);
        assert_eq!(chain.account_now(&"alice".into()).free, 1_000);
    }

    #[tokio::test]
    async fn test_simulate_failure_reports_module_error() {
        let (chain, simulator) = setup(50, ChainParams::default(), SimulatorSettings::default());

        let result = simulator.simulate(&"alice".into(), &transfer(100)).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_message().unwrap(), "Balances.InsufficientBalance");
        assert_eq!(chain.open_forks(), 0);
    }

    #[tokio::test]
    async fn test_sequence_is_order_sensitive() {
        let (chain, simulator) = setup(120, ChainParams::default(), SimulatorSettings::default());

        // each call alone succeeds
        assert!(simulator.simulate(&"alice".into(), &transfer(100)).await.unwrap().success);
        assert!(simulator
            .simulate(&"alice".into(), &ChainCall::Bond { amount: 50 })
            .await
            .unwrap()
            .success);

        let result = simulator
            .simulate_sequence(&[step(transfer(100)), step(ChainCall::Bond { amount: 50 })])
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(1));
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[0].success);
        assert_eq!(
            result.failure,
            Some(FailureReason::Dispatch(DispatchError::new("Balances", "InsufficientBalance")))
        );
        assert_eq!(
            result.error_message().unwrap(),
            "Step 2 failed: Balances.InsufficientBalance"
        );
        // only the completed step counts
        assert_eq!(result.cumulative_fee, 1);
        assert_eq!(result.net_balance_deltas.len(), 2);

        let swapped = simulator
            .simulate_sequence(&[step(ChainCall::Bond { amount: 50 }), step(transfer(100))])
            .await
            .unwrap();
        assert_eq!(swapped.failed_step, Some(1));
        assert!(swapped.steps[0].success);

        assert_eq!(chain.open_forks(), 0);
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let (_chain, simulator) = setup(50, ChainParams::default(), SimulatorSettings::default());

        let result = simulator
            .simulate_sequence(&[step(transfer(100)), step(transfer(1)), step(transfer(1))])
            .await
            .unwrap();

        assert_eq!(result.failed_step, Some(0));
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.cumulative_fee, 0);
        assert!(result.net_balance_deltas.is_empty());
    }

    #[tokio::test]
    async fn test_fork_point_is_cached_within_ttl() {
        let settings = SimulatorSettings {
            fork_point_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let (chain, simulator) = setup(1_000, ChainParams::default(), settings);

        let first = simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        chain
            .submit(SignedPayload {
                signer: "alice".into(),
                call: transfer(5),
                signature: "0x01".to_string(),
            })
            .await
            .unwrap();
        let second = simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        assert_eq!(first.block_hash, second.block_hash);

        let settings = SimulatorSettings {
            fork_point_ttl: Duration::ZERO,
            ..Default::default()
        };
        let fresh = ForkSimulator::new(Arc::new(chain.clone()), Arc::new(chain.clone()), settings);
        let third = fresh.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        assert_ne!(first.block_hash, third.block_hash);
    }

    #[tokio::test]
    async fn test_pruned_fork_point_retries_with_reduced_confidence() {
        let params = ChainParams {
            pruning_depth: 1,
            ..Default::default()
        };
        let settings = SimulatorSettings {
            fork_point_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let (chain, simulator) = setup(1_000, params, settings);

        simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        chain
            .submit(SignedPayload {
                signer: "alice".into(),
                call: transfer(5),
                signature: "0x01".to_string(),
            })
            .await
            .unwrap();

        let result = simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.confidence, Confidence::Reduced);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(chain.open_forks(), 0);
    }

    #[tokio::test]
    async fn test_pruned_fork_point_without_retry_errors() {
        let params = ChainParams {
            pruning_depth: 1,
            ..Default::default()
        };
        let settings = SimulatorSettings {
            fork_point_ttl: Duration::from_secs(60),
            retry_pruned_with_latest: false,
        };
        let (chain, simulator) = setup(1_000, params, settings);

        simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap();
        chain
            .submit(SignedPayload {
                signer: "alice".into(),
                call: transfer(5),
                signature: "0x01".to_string(),
            })
            .await
            .unwrap();

        let err = simulator.simulate(&"alice".into(), &transfer(1)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Fork(_)));
    }

    struct BrokenSession {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ForkSession for BrokenSession {
        fn block_hash(&self) -> BlockHash {
            BlockHash::ZERO
        }

        async fn dry_run(&mut self, _origin: &AccountId, _call: &ChainCall) -> std::result::Result<DryRunOutcome, ForkError> {
            Err(ForkError::SetupFailed("runtime call failed".to_string()))
        }

        async fn account(&self, _address: &AccountId) -> std::result::Result<AccountInfo, ForkError> {
            Ok(AccountInfo::with_free(100))
        }

        async fn close(&mut self) {
            self.release();
        }

        fn release(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BrokenForks {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ForkProvider for BrokenForks {
        async fn open(&self, _at: Option<BlockHash>) -> std::result::Result<Box<dyn ForkSession>, ForkError> {
            Ok(Box::new(BrokenSession {
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_fork_is_closed_when_dry_run_errors() {
        let chain = LocalChain::new(ChainParams::default(), vec![(AccountId::from("alice"), 1_000)]);
        let closed = Arc::new(AtomicUsize::new(0));
        let simulator = ForkSimulator::new(
            Arc::new(chain),
            Arc::new(BrokenForks {
                closed: closed.clone(),
            }),
            SimulatorSettings::default(),
        );

        assert!(simulator.simulate(&"alice".into(), &transfer(1)).await.is_err());
        assert!(simulator
            .simulate_sequence(&[step(transfer(1)), step(transfer(2))])
            .await
            .is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    /// Opens real forks but stalls every dry-run
    struct SlowForks {
        chain: LocalChain,
    }

    struct SlowSession {
        inner: Box<dyn ForkSession>,
    }

    #[async_trait]
    impl ForkSession for SlowSession {
        fn block_hash(&self) -> BlockHash {
            self.inner.block_hash()
        }

        async fn dry_run(&mut self, origin: &AccountId, call: &ChainCall) -> std::result::Result<DryRunOutcome, ForkError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.inner.dry_run(origin, call).await
        }

        async fn account(&self, address: &AccountId) -> std::result::Result<AccountInfo, ForkError> {
            self.inner.account(address).await
        }

        async fn close(&mut self) {
            self.inner.close().await;
        }

        fn release(&mut self) {
            self.inner.release();
        }
    }

    #[async_trait]
    impl ForkProvider for SlowForks {
        async fn open(&self, at: Option<BlockHash>) -> std::result::Result<Box<dyn ForkSession>, ForkError> {
            let inner = self.chain.open(at).await?;
            Ok(Box::new(SlowSession { inner }))
        }
    }

    #[tokio::test]
    async fn test_cancelled_simulation_releases_fork() {
        let chain = LocalChain::new(ChainParams::default(), vec![(AccountId::from("alice"), 1_000)]);
        let simulator = ForkSimulator::new(
            Arc::new(chain.clone()),
            Arc::new(SlowForks { chain: chain.clone() }),
            SimulatorSettings::default(),
        );

        let single = tokio::time::timeout(
            Duration::from_millis(50),
            simulator.simulate(&"alice".into(), &transfer(1)),
        )
        .await;
        assert!(single.is_err());
        assert_eq!(chain.open_forks(), 0);

        let sequence = tokio::time::timeout(
            Duration::from_millis(50),
            simulator.simulate_sequence(&[step(transfer(1)), step(transfer(2))]),
        )
        .await;
        assert!(sequence.is_err());
        assert_eq!(chain.open_forks(), 0);
    }
}
