//! Signing approval queue
//!
//! The executioner pushes one `ApprovalRequest` per prompt and awaits its
//! responder. Whoever owns the receiving side (an HTTP handler, a test, a
//! CLI) answers each request exactly once.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use types::{ApprovalPrompt, ExecutorError, Result, SigningDecision};

/// Reason recorded when a request is dropped unanswered
pub const DROPPED_REASON: &str = "Approval request dropped without a decision";

/// A prompt waiting for the user's decision
#[derive(Debug)]
pub struct ApprovalRequest {
    prompt: ApprovalPrompt,
    responder: oneshot::Sender<SigningDecision>,
}

impl ApprovalRequest {
    pub fn prompt(&self) -> &ApprovalPrompt {
        &self.prompt
    }

    pub fn approve(self) -> bool {
        self.respond(SigningDecision::Approve)
    }

    pub fn reject(self, reason: Option<String>) -> bool {
        self.respond(SigningDecision::Reject { reason })
    }

    /// Returns false when the executioner stopped waiting
    pub fn respond(self, decision: SigningDecision) -> bool {
        self.responder.send(decision).is_ok()
    }
}

/// Sending half held by the executioner
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    tx: mpsc::Sender<ApprovalRequest>,
}

/// Bounded approval channel
pub fn approval_channel(capacity: usize) -> (ApprovalQueue, mpsc::Receiver<ApprovalRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ApprovalQueue { tx }, rx)
}

impl ApprovalQueue {
    /// Enqueue a prompt and wait for the decision
    pub async fn request(&self, prompt: ApprovalPrompt) -> Result<SigningDecision> {
        let (responder, decision) = oneshot::channel();
        let request_id = prompt.request_id();

        self.tx
            .send(ApprovalRequest { prompt, responder })
            .await
            .map_err(|_| ExecutorError::Approval("approval handler is gone".to_string()))?;
        debug!(request_id = %request_id, "Waiting for signing approval");

        match decision.await {
            Ok(decision) => Ok(decision),
            Err(_) => {
                warn!(request_id = %request_id, "Approval request dropped");
                Ok(SigningDecision::Reject {
                    reason: Some(DROPPED_REASON.to_string()),
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
