//! Shared types for the Plan Executor system
//!
//! This crate contains the domain types shared by the execution engine,
//! the simulator, the broadcast layer and the gateway.

pub mod chain;
pub mod error;
pub mod execution;
pub mod plan;
pub mod signing;
pub mod simulation;
pub mod utils;
pub mod wire;

// Re-export commonly used types
pub use chain::*;
pub use error::{ChainError, ConfigError, ExecutorError, ForkError, PlanError, Result, SignerError};
pub use execution::*;
pub use plan::AgentResult;
pub use signing::*;
pub use simulation::*;
pub use wire::{ClientCommand, RoomKey, ServerEvent};
