//! Approval inbox
//!
//! Drains the executioner's approval queue into a pending map so the UI can
//! list prompts and answer them over HTTP.

use execution::ApprovalRequest;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{ApprovalPrompt, SigningDecision};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ApprovalInbox {
    pending: Arc<Mutex<BTreeMap<Uuid, ApprovalRequest>>>,
}

impl ApprovalInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every incoming request into the inbox until the queue closes
    pub fn spawn_drain(&self, mut requests: mpsc::Receiver<ApprovalRequest>) -> JoinHandle<()> {
        let inbox = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let request_id = request.prompt().request_id();
                info!(
                    request_id = %request_id,
                    execution_id = %request.prompt().execution_id(),
                    "Signing approval requested"
                );
                inbox.lock().insert(request_id, request);
            }
            debug!("Approval queue closed");
        })
    }

    /// Prompts still waiting for a decision
    pub fn pending(&self) -> Vec<ApprovalPrompt> {
        self.lock().values().map(|request| request.prompt().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Answer a prompt; `None` when no such request is pending
    pub fn resolve(&self, request_id: &Uuid, decision: SigningDecision) -> Option<bool> {
        let request = self.lock().remove(request_id)?;
        let approved = decision.is_approved();
        let delivered = request.respond(decision);
        if !delivered {
            warn!(request_id = %request_id, "Executioner stopped waiting for this approval");
        }
        info!(request_id = %request_id, approved, "Signing approval resolved");
        Some(delivered)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, ApprovalRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
