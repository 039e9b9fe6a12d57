//! Approval channel port.
//!
//! The governance gate awaits user/admin verdicts through this seam; the
//! transport that actually reaches a human is an external collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::domain::models::governance::{GovernanceTier, ProposedAction};

/// A human verdict on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerdict {
    Granted,
    Rejected,
}

/// Request forwarded to whatever surface collects approvals.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub decision_id: Uuid,
    pub action: ProposedAction,
    pub tier: GovernanceTier,
    pub expires_at: DateTime<Utc>,
}

/// Channel through which user/admin approvals arrive.
///
/// `await_verdict` resolves when a human answers, or never; the gate bounds
/// the wait with the decision's `expires_at` and treats expiry as deny.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn await_verdict(&self, request: ApprovalRequest) -> Option<ApprovalVerdict>;
}

/// Channel with no approvers configured: requests are recorded, nobody
/// ever answers, and every approval-gated decision expires to deny.
pub struct NullApprovalChannel;

#[async_trait]
impl ApprovalChannel for NullApprovalChannel {
    async fn await_verdict(&self, _request: ApprovalRequest) -> Option<ApprovalVerdict> {
        // Pend until the gate's deadline fires.
        futures::future::pending::<()>().await;
        None
    }
}

/// In-memory channel for tests and local operation: pending requests are
/// listed and answered through a shared handle.
#[derive(Clone, Default)]
pub struct ManualApprovalChannel {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<ApprovalVerdict>>>>,
}

impl ManualApprovalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of requests currently awaiting a verdict.
    pub async fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.lock().await.keys().copied().collect()
    }

    /// Answer a pending request; returns false if it is unknown or expired.
    pub async fn answer(&self, decision_id: Uuid, verdict: ApprovalVerdict) -> bool {
        let sender = self.pending.lock().await.remove(&decision_id);
        match sender {
            Some(tx) => tx.send(verdict).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalChannel for ManualApprovalChannel {
    async fn await_verdict(&self, request: ApprovalRequest) -> Option<ApprovalVerdict> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.decision_id, tx);
        let verdict = rx.await.ok();
        // Drop the entry if the sender side was abandoned.
        self.pending.lock().await.remove(&request.decision_id);
        verdict
    }
}
