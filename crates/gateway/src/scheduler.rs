//! Background task scheduler

use crate::app::AppState;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Background task scheduler
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(state: Arc<AppState>, shutdown: CancellationToken) -> Self {
        Self { state, shutdown }
    }

    /// Run until shutdown is requested
    pub async fn run(&self) {
        let period = self.state.config.sessions.cleanup_interval();
        let mut cleanup_interval = interval(period.max(Duration::from_secs(1)));
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    return;
                }
                _ = cleanup_interval.tick() => {
                    if let Err(e) = self.cleanup_expired_executions().await {
                        tracing::error!("Cleanup task failed: {}", e);
                    }
                }
            }
        }
    }

    /// Discard finished executions past retention, then empty sessions
    pub async fn cleanup_expired_executions(&self) -> Result<usize> {
        let retention = self.state.config.sessions.retention();
        let mut removed = 0;
        for session in self.state.sessions().await {
            removed += session.prune(retention).await;
        }
        let sessions = self.state.drop_idle_sessions().await;

        tracing::debug!(removed, sessions, "Execution cleanup finished");
        Ok(removed)
    }
}
