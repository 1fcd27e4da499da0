//! Main application structure and lifecycle management

use crate::{api::ApiServer, approvals::ApprovalInbox, scheduler::Scheduler, session::SessionContext};
use anyhow::{Context, Result};
use chain_client::{ChainClient, ChainParams, DevSigner, FinalityMode, LocalChain, Signer, HttpSigner};
use config::{Config, SignerMode};
use execution::{approval_channel, ExecutionArray, ExecutionOptions, Executioner};
use simulator::{ForkSimulator, PlanValidator, SimulationEngine, SimulatorSettings, ValidationRules};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use types::{ExecutionId, SessionId};

/// Shared state handed to every request handler
pub struct AppState {
    pub config: Config,
    pub chain: LocalChain,
    pub simulator: Arc<dyn SimulationEngine>,
    pub validator: PlanValidator,
    pub executioner: Arc<Executioner>,
    pub approvals: ApprovalInbox,
    sessions: RwLock<HashMap<SessionId, Arc<SessionContext>>>,
}

impl AppState {
    /// Wire the chain, signer, simulator and executioner from configuration
    pub fn new(config: Config) -> Result<Self> {
        let params = ChainParams {
            existential_deposit: config.chain.existential_deposit,
            base_fee: config.chain.base_fee,
            pruning_depth: config.chain.pruning_depth,
        };
        let chain = LocalChain::new(
            params,
            config
                .chain
                .accounts
                .iter()
                .map(|account| (account.address.clone(), account.balance)),
        );
        if config.chain.finality_delay_ms > 0 {
            chain.set_finality(FinalityMode::Delayed(Duration::from_millis(
                config.chain.finality_delay_ms,
            )));
        }

        let signer: Arc<dyn Signer> = match config.signer.mode {
            SignerMode::Dev => Arc::new(DevSigner::new(
                config.chain.accounts.iter().map(|account| account.address.clone()),
            )),
            SignerMode::Http => {
                let url = config
                    .signer
                    .url
                    .clone()
                    .context("signer.url is required in http mode")?;
                Arc::new(
                    HttpSigner::new(url, Duration::from_secs(config.signer.timeout_seconds))
                        .context("Failed to create HTTP signer")?,
                )
            }
        };

        let client: Arc<dyn ChainClient> = Arc::new(chain.clone());
        let simulator: Arc<dyn SimulationEngine> = Arc::new(ForkSimulator::new(
            client.clone(),
            Arc::new(chain.clone()),
            SimulatorSettings {
                fork_point_ttl: config.simulation.fork_point_ttl(),
                retry_pruned_with_latest: config.simulation.retry_pruned_with_latest,
            },
        ));
        let validator = PlanValidator::new(
            client.clone(),
            ValidationRules {
                existential_deposit: config.chain.existential_deposit,
                ..ValidationRules::default()
            },
        )
        .with_simulator(simulator.clone());

        let (queue, requests) = approval_channel(config.execution.approval_queue_capacity);
        let approvals = ApprovalInbox::new();
        approvals.spawn_drain(requests);

        let executioner = Arc::new(Executioner::new(client, signer).with_approvals(queue));

        Ok(Self {
            config,
            chain,
            simulator,
            validator,
            executioner,
            approvals,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Default options for new runs
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions::from(&self.config.execution)
    }

    /// Get or create the context of `session_id`
    pub async fn session(&self, session_id: &str) -> Arc<SessionContext> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return session.clone();
        }
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id = %session_id, "Session created");
                Arc::new(SessionContext::new(session_id))
            })
            .clone()
    }

    pub async fn sessions(&self) -> Vec<Arc<SessionContext>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Find an execution in any session
    pub async fn find_execution(&self, execution_id: &ExecutionId) -> Option<Arc<ExecutionArray>> {
        for session in self.sessions().await {
            if let Some(array) = session.execution(execution_id).await {
                return Some(array);
            }
        }
        None
    }

    /// Start a background run of `array`
    pub fn spawn_execution(&self, array: Arc<ExecutionArray>, options: ExecutionOptions) {
        let executioner = self.executioner.clone();
        tokio::spawn(async move {
            let execution_id = array.execution_id();
            if let Err(e) = executioner.execute(&array, &options).await {
                warn!(execution_id = %execution_id, error = %e, "Execution run ended with error");
            }
        });
    }

    /// Forget sessions without executions or live connections
    pub async fn drop_idle_sessions(&self) -> usize {
        let mut idle = Vec::new();
        for session in self.sessions().await {
            if session.execution_count().await == 0 && session.hub().connection_count() == 0 {
                idle.push(session.session_id().to_string());
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &idle {
            sessions.remove(id);
        }
        idle.len()
    }
}

/// Main application that coordinates all components
pub struct Application {
    state: Arc<AppState>,
    api_server: ApiServer,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl Application {
    /// Create a new application instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing application components...");

        let state = Arc::new(AppState::new(config).context("Failed to initialize application state")?);
        let shutdown = CancellationToken::new();

        let api_server = ApiServer::new(state.clone()).context("Failed to create API server")?;
        let scheduler = Scheduler::new(state.clone(), shutdown.clone());

        info!("Application components initialized successfully");

        Ok(Self {
            state,
            api_server,
            scheduler,
            shutdown,
        })
    }

    /// Run the application
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting application services...");

        let scheduler_handle = {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        info!("Background scheduler started");

        info!(
            "Starting API server on {}:{}",
            self.state.config.server.host, self.state.config.server.port
        );

        tokio::select! {
            result = self.api_server.run(self.shutdown.clone()) => {
                result.context("API server error")?;
            }
            result = scheduler_handle => {
                result.context("Scheduler task error")?;
            }
        }

        Ok(())
    }

    /// Token that stops the server and scheduler when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down application...");
        self.shutdown.cancel();

        let pending = self.state.approvals.len();
        if pending > 0 {
            warn!(pending, "Shutting down with unanswered approval requests");
        }

        info!("Application shutdown complete");
        Ok(())
    }
}
