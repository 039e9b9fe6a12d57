//! Governance gate.
//!
//! Classifies every proposed action into a tier (first match wins, deny
//! list first) and resolves it to a decision. Approval-gated tiers wait on
//! the approval channel bounded by the configured timeout; expiry resolves
//! to deny. Every final decision is published (and therefore audited)
//! before the caller may act.

use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::config::GovernanceConfig;
use crate::domain::models::governance::{
    DecisionKind, GovernanceDecision, GovernanceTier, ProposedAction,
};
use crate::domain::models::playbook::RiskLevel;
use crate::domain::ports::approvals::{ApprovalChannel, ApprovalRequest, ApprovalVerdict};
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// Action types classified T0 (read-only surface).
const READ_ONLY: &[&str] = &["read", "search", "inspect", "stats"];

/// Action types classified T2 (user approval).
const TIER2: &[&str] = &["file_write", "file_delete", "code_execution", "network_egress"];

/// Action types classified T3 (admin approval).
const TIER3: &[&str] = &[
    "system_command",
    "database_schema_change",
    "secret_access",
    "cross_tenant_op",
];

/// The governance gate service.
pub struct GovernanceGate {
    config: GovernanceConfig,
    approvals: Arc<dyn ApprovalChannel>,
    publisher: Arc<UnifiedPublisher>,
}

impl GovernanceGate {
    pub fn new(
        config: GovernanceConfig,
        approvals: Arc<dyn ApprovalChannel>,
        publisher: Arc<UnifiedPublisher>,
    ) -> Self {
        Self {
            config,
            approvals,
            publisher,
        }
    }

    /// Pure classification: tier, decision kind, and reason.
    ///
    /// The table is exhaustive and first-match-wins; anything the table
    /// does not know falls to the configured default tier.
    pub fn classify(&self, action: &ProposedAction) -> (GovernanceTier, DecisionKind, String) {
        // Deny list comes before everything else.
        for pattern in &self.config.deny_patterns {
            if action.action_type.contains(pattern.as_str())
                || action.resource.contains(pattern.as_str())
            {
                return (
                    GovernanceTier::T3,
                    DecisionKind::Deny,
                    format!("matches deny pattern '{pattern}'"),
                );
            }
        }

        let base = action.action_type.as_str();
        let (mut tier, mut reason) = if READ_ONLY.iter().any(|t| kind_matches(base, t)) {
            (GovernanceTier::T0, "read-only action".to_string())
        } else if self.config.whitelisted_toggles.iter().any(|t| t == base) {
            (GovernanceTier::T1, "whitelisted idempotent toggle".to_string())
        } else if TIER2.iter().any(|t| kind_matches(base, t)) {
            (GovernanceTier::T2, "state-changing action".to_string())
        } else if TIER3.iter().any(|t| kind_matches(base, t)) {
            (GovernanceTier::T3, "privileged action".to_string())
        } else {
            let tier = GovernanceTier::from_str(&self.config.default_tier)
                .unwrap_or(GovernanceTier::T2);
            (tier, format!("unclassified action defaults to {}", tier.as_str()))
        };

        // Risk escalates one tier; only meaningful risk does.
        if matches!(
            action.context.risk_level,
            Some(RiskLevel::High | RiskLevel::Critical)
        ) {
            tier = tier.escalate();
            reason.push_str("; escalated by risk level");
        }

        // High caller trust relaxes T2 to T1 for whitelisted action types.
        if tier == GovernanceTier::T2
            && self.config.trust_relaxable.iter().any(|t| t == base)
            && action
                .context
                .trust_score
                .is_some_and(|t| t >= self.config.trust_threshold)
        {
            tier = GovernanceTier::T1;
            reason.push_str("; relaxed by caller trust");
        }

        let decision = match tier {
            GovernanceTier::T0 | GovernanceTier::T1 => DecisionKind::AutoApprove,
            GovernanceTier::T2 => DecisionKind::UserApproval,
            GovernanceTier::T3 => DecisionKind::AdminApproval,
        };
        (tier, decision, reason)
    }

    /// Classify and fully resolve a proposed action.
    ///
    /// Auto approvals and denials resolve immediately. Approval-gated
    /// decisions wait on the approval channel until `expires_at`; a missing
    /// or late verdict resolves to deny with reason `approval_expired`.
    /// The final decision is always published before returning.
    #[instrument(skip(self, action), fields(action_type = %action.action_type, actor = %action.actor))]
    pub async fn authorize(&self, action: &ProposedAction) -> DomainResult<GovernanceDecision> {
        let (tier, kind, reason) = self.classify(action);
        let now = self.publisher.clock().now_utc();

        match kind {
            DecisionKind::AutoApprove => {
                let decision = GovernanceDecision::new(kind, tier, reason, now);
                if tier == GovernanceTier::T1 {
                    info!(action_type = %action.action_type, "auto-approved whitelisted toggle");
                }
                self.publish_decision(&decision, action).await?;
                Ok(decision)
            }
            DecisionKind::Deny => {
                let decision = GovernanceDecision::new(kind, tier, reason, now);
                warn!(action_type = %action.action_type, reason = %decision.reason, "governance denied action");
                self.publish_decision(&decision, action).await?;
                Ok(decision)
            }
            DecisionKind::UserApproval | DecisionKind::AdminApproval => {
                self.resolve_with_approval(action, tier, kind, reason).await
            }
        }
    }

    async fn resolve_with_approval(
        &self,
        action: &ProposedAction,
        tier: GovernanceTier,
        kind: DecisionKind,
        reason: String,
    ) -> DomainResult<GovernanceDecision> {
        let now = self.publisher.clock().now_utc();
        let timeout = Duration::milliseconds(self.config.approval_timeout_ms as i64);
        let expires_at = now + timeout;
        let pending = GovernanceDecision::new(kind, tier, reason, now).with_expiry(expires_at);

        let mut payload = Map::new();
        payload.insert("decision_id".to_string(), json!(pending.id.to_string()));
        payload.insert("tier".to_string(), json!(tier.as_str()));
        payload.insert("action_type".to_string(), json!(action.action_type));
        payload.insert("expires_at".to_string(), json!(expires_at.to_rfc3339()));
        self.publisher
            .publish_typed(
                crate::domain::models::event::EventType::GovernanceApprovalRequested,
                payload,
                "governance",
                PublishOpts::default(),
            )
            .await?;

        let request = ApprovalRequest {
            decision_id: pending.id,
            action: action.clone(),
            tier,
            expires_at,
        };
        let wait = std::time::Duration::from_millis(self.config.approval_timeout_ms);
        let verdict = tokio::time::timeout(wait, self.approvals.await_verdict(request)).await;

        let resolved_at = self.publisher.clock().now_utc();
        let decision = match verdict {
            Ok(Some(ApprovalVerdict::Granted)) => {
                let mut d = GovernanceDecision::new(kind, tier, "approved", resolved_at)
                    .with_expiry(expires_at);
                d.id = pending.id;
                d
            }
            Ok(Some(ApprovalVerdict::Rejected)) => {
                let mut d = GovernanceDecision::new(
                    DecisionKind::Deny,
                    tier,
                    "approval_rejected",
                    resolved_at,
                )
                .with_expiry(expires_at);
                d.id = pending.id;
                d
            }
            Ok(None) | Err(_) => {
                let mut payload = Map::new();
                payload.insert("decision_id".to_string(), json!(pending.id.to_string()));
                payload.insert("tier".to_string(), json!(tier.as_str()));
                self.publisher
                    .publish_typed(
                        crate::domain::models::event::EventType::GovernanceApprovalExpired,
                        payload,
                        "governance",
                        PublishOpts::default(),
                    )
                    .await?;
                let mut d = GovernanceDecision::new(
                    DecisionKind::Deny,
                    tier,
                    "approval_expired",
                    resolved_at,
                )
                .with_expiry(expires_at);
                d.id = pending.id;
                d
            }
        };

        self.publish_decision(&decision, action).await?;
        Ok(decision)
    }

    async fn publish_decision(
        &self,
        decision: &GovernanceDecision,
        action: &ProposedAction,
    ) -> DomainResult<()> {
        let mut payload = Map::new();
        payload.insert("decision_id".to_string(), json!(decision.id.to_string()));
        payload.insert("decision".to_string(), json!(decision.decision.as_str()));
        payload.insert("tier".to_string(), json!(decision.tier.as_str()));
        payload.insert("reason".to_string(), json!(decision.reason));
        payload.insert("action_type".to_string(), json!(action.action_type));
        payload.insert("actor".to_string(), json!(action.actor));
        payload.insert("resource".to_string(), json!(action.resource));
        if let Some(expires_at) = decision.expires_at {
            payload.insert("expires_at".to_string(), json!(expires_at.to_rfc3339()));
        }
        self.publisher
            .publish_typed(
                crate::domain::models::event::EventType::GovernanceDecision,
                payload,
                "governance",
                PublishOpts::default(),
            )
            .await?;
        Ok(())
    }
}

fn kind_matches(action_type: &str, kind: &str) -> bool {
    action_type == kind
        || (action_type.len() > kind.len()
            && action_type.starts_with(kind)
            && action_type.as_bytes()[kind.len()] == b'.')
}
