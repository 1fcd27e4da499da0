//! Simulation engine traits and interfaces

use async_trait::async_trait;
use types::{AccountId, ChainCall, Result, SequentialSimulationResult, SimulationResult, SimulationStep};

/// Trait for dry-run simulation engines
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Dry-run a single call against current finalized state
    async fn simulate(&self, origin: &AccountId, call: &ChainCall) -> Result<SimulationResult>;

    /// Dry-run calls in order on one fork, each observing the effects of
    /// the previous ones. Stops at the first failing step.
    async fn simulate_sequence(&self, steps: &[SimulationStep]) -> Result<SequentialSimulationResult>;

    /// Get the name of the simulation engine
    fn name(&self) -> &str;
}
