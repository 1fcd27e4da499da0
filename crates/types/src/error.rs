//! Error types for the Plan Executor system

use crate::chain::BlockHash;
use thiserror::Error;

/// Main error type for the plan executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed plan rejected at seed time
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Backwards or otherwise illegal status transition
    #[error("Invalid status transition for item {item_id}: {from} -> {to}")]
    InvalidTransition {
        item_id: String,
        from: String,
        to: String,
    },

    /// Mutation attempted on a terminal item
    #[error("Item {item_id} is already terminal ({status})")]
    ItemTerminal { item_id: String, status: String },

    /// Execution array state errors
    #[error("Execution state error: {0}")]
    State(String),

    /// A second execute() on a running array
    #[error("Execution {execution_id} is already running")]
    AlreadyExecuting { execution_id: String },

    /// Item failed and continue_on_error is off
    #[error("Item {item_id} failed: {reason}")]
    ItemFailed { item_id: String, reason: String },

    /// User rejected a signing request and continue_on_error is off
    #[error("Item {item_id} cancelled: {reason}")]
    ItemCancelled { item_id: String, reason: String },

    /// Approval channel errors
    #[error("Approval error: {0}")]
    Approval(String),

    /// Signer capability errors
    #[error("Signer error: {0}")]
    Signer(String),

    /// Chain client errors
    #[error("Chain error: {0}")]
    Chain(String),

    /// Fork session errors
    #[error("Fork error: {0}")]
    Fork(String),

    /// Simulation errors
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Timeout waiting for a long running operation
    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    /// Connection loss or other transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Errors that reject a whole `execute()` call rather than one item
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExecutorError::Timeout { .. } | ExecutorError::Transport(_)
        )
    }
}

/// Result type alias for plan executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Plan seeding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Plan contains no items
    #[error("Plan is empty")]
    Empty,

    /// Extrinsic item without a call
    #[error("Item {index} is an extrinsic without a call")]
    MissingCall { index: usize },

    /// Extrinsic item without a signer
    #[error("Item {index} is an extrinsic without a signer")]
    MissingSigner { index: usize },

    /// Data item without materialized data
    #[error("Item {index} of type {execution_type} carries no data")]
    MissingData { index: usize, execution_type: String },

    /// Two items share an id
    #[error("Duplicate item id: {id}")]
    DuplicateId { id: String },

    /// Array already seeded or running
    #[error("Execution array is not idle")]
    NotIdle,
}

/// Chain client errors
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// Connection problems talking to the node
    #[error("Connection to chain failed: {0}")]
    Connection(String),

    /// Transaction rejected by the pool before inclusion
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Transaction dropped from the pool
    #[error("Transaction dropped: {0}")]
    Dropped(String),

    /// Signature did not verify
    #[error("Bad signature for {signer}")]
    BadSignature { signer: String },

    /// Storage or block lookup failed
    #[error("Unknown block: {0}")]
    UnknownBlock(BlockHash),
}

/// Fork provider errors
#[derive(Error, Debug, Clone)]
pub enum ForkError {
    /// Requested fork point is no longer available
    #[error("Block {block} has been pruned")]
    BlockPruned { block: BlockHash },

    /// Fork could not be created
    #[error("Fork setup failed: {0}")]
    SetupFailed(String),

    /// Session used after close
    #[error("Fork session closed")]
    Closed,
}

/// Signer capability errors
#[derive(Error, Debug, Clone)]
pub enum SignerError {
    /// Unknown account
    #[error("No key for account {0}")]
    UnknownAccount(String),

    /// Remote signer request failed
    #[error("Remote signer error: {0}")]
    Remote(String),

    /// Remote signer timed out
    #[error("Remote signer timed out")]
    Timeout,
}

/// Configuration specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Parse error
    #[error("Configuration parse error: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Configuration validation error: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

// Conversion implementations for common error types

impl From<PlanError> for ExecutorError {
    fn from(err: PlanError) -> Self {
        ExecutorError::InvalidPlan(err.to_string())
    }
}

impl From<ChainError> for ExecutorError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Connection(message) => ExecutorError::Transport(message),
            other => ExecutorError::Chain(other.to_string()),
        }
    }
}

impl From<ForkError> for ExecutorError {
    fn from(err: ForkError) -> Self {
        ExecutorError::Fork(err.to_string())
    }
}

impl From<SignerError> for ExecutorError {
    fn from(err: SignerError) -> Self {
        ExecutorError::Signer(err.to_string())
    }
}

impl From<ConfigError> for ExecutorError {
    fn from(err: ConfigError) -> Self {
        ExecutorError::Config(err.to_string())
    }
}
