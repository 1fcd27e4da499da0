//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::time::Duration;
use types::{utils, AccountId, Balance};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chain parameters and development chain genesis
    #[serde(default)]
    pub chain: ChainConfig,
    /// Executioner defaults
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Fork simulation settings
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Signing backend
    #[serde(default)]
    pub signer: SignerConfig,
    /// Broadcast client reconnect policy
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Session retention
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Network name (local, westend, polkadot)
    #[serde(default = "default_network")]
    pub network: String,
    /// Minimum balance an account must keep to stay alive
    #[serde(default = "default_existential_deposit", with = "utils::balance_str")]
    pub existential_deposit: Balance,
    /// Flat fee charged per submitted call
    #[serde(default = "default_base_fee", with = "utils::balance_str")]
    pub base_fee: Balance,
    /// Blocks of state kept before a block is pruned
    #[serde(default = "default_pruning_depth")]
    pub pruning_depth: u64,
    /// Delay between inclusion and finality
    #[serde(default)]
    pub finality_delay_ms: u64,
    /// Genesis balances for the development chain
    #[serde(default = "default_accounts")]
    pub accounts: Vec<GenesisAccount>,
}

/// Genesis balance entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: AccountId,
    #[serde(with = "utils::balance_str")]
    pub balance: Balance,
}

/// Executioner defaults, overridable per execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub allow_batching: bool,
    /// Per-item finality timeout
    #[serde(default = "default_execution_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub sequential: bool,
    /// Approve every signing request without asking
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Pending approval requests before the executioner blocks
    #[serde(default = "default_approval_queue_capacity")]
    pub approval_queue_capacity: usize,
}

/// Fork simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// How long a resolved fork point may be reused
    #[serde(default = "default_fork_point_ttl")]
    pub fork_point_ttl_seconds: u64,
    /// Retry at the latest block when the fork point was pruned
    #[serde(default = "default_true")]
    pub retry_pruned_with_latest: bool,
}

/// Which signer backs approvals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerMode {
    /// Deterministic development keys
    Dev,
    /// External wallet bridge over HTTP
    Http,
}

/// Signer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    #[serde(default = "default_signer_mode")]
    pub mode: SignerMode,
    /// Wallet bridge base URL, required for http mode
    pub url: Option<String>,
    #[serde(default = "default_signer_timeout")]
    pub timeout_seconds: u64,
}

/// Broadcast client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
}

/// Session retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Finished executions older than this are discarded
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_network() -> String {
    "local".to_string()
}

fn default_existential_deposit() -> Balance {
    10
}

fn default_base_fee() -> Balance {
    1
}

fn default_pruning_depth() -> u64 {
    256
}

fn default_accounts() -> Vec<GenesisAccount> {
    ["alice", "bob", "charlie"]
        .into_iter()
        .map(|name| GenesisAccount {
            address: AccountId::from(name),
            balance: 1_000_000,
        })
        .collect()
}

fn default_execution_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_batch_size() -> usize {
    100
}

fn default_approval_queue_capacity() -> usize {
    32
}

fn default_fork_point_ttl() -> u64 {
    6 // one block
}

fn default_signer_mode() -> SignerMode {
    SignerMode::Dev
}

fn default_signer_timeout() -> u64 {
    120
}

fn default_reconnect_delay() -> u64 {
    250
}

fn default_max_reconnect_delay() -> u64 {
    5000
}

fn default_retention() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl SimulationConfig {
    pub fn fork_point_ttl(&self) -> Duration {
        Duration::from_secs(self.fork_point_ttl_seconds)
    }
}

impl SessionsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            existential_deposit: default_existential_deposit(),
            base_fee: default_base_fee(),
            pruning_depth: default_pruning_depth(),
            finality_delay_ms: 0,
            accounts: default_accounts(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            allow_batching: default_true(),
            timeout_seconds: default_execution_timeout(),
            sequential: default_true(),
            auto_approve: false,
            max_batch_size: default_max_batch_size(),
            approval_queue_capacity: default_approval_queue_capacity(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fork_point_ttl_seconds: default_fork_point_ttl(),
            retry_pruned_with_latest: default_true(),
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            mode: default_signer_mode(),
            url: None,
            timeout_seconds: default_signer_timeout(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            cors_enabled: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
