//! Governance domain model.
//!
//! Every proposed state-changing action is classified into a tier and
//! resolved to a decision before anything executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::models::playbook::RiskLevel;

/// Governance tier; higher tiers need stronger approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceTier {
    T0,
    T1,
    T2,
    T3,
}

impl GovernanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T0 => "t0",
            Self::T1 => "t1",
            Self::T2 => "t2",
            Self::T3 => "t3",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "t0" => Some(Self::T0),
            "t1" => Some(Self::T1),
            "t2" => Some(Self::T2),
            "t3" => Some(Self::T3),
            _ => None,
        }
    }

    /// Escalate one tier (saturating at T3).
    pub fn escalate(self) -> Self {
        match self {
            Self::T0 => Self::T1,
            Self::T1 => Self::T2,
            Self::T2 | Self::T3 => Self::T3,
        }
    }

    /// Relax one tier (saturating at T0).
    pub fn relax(self) -> Self {
        match self {
            Self::T3 => Self::T2,
            Self::T2 => Self::T1,
            Self::T1 | Self::T0 => Self::T0,
        }
    }
}

/// Outcome kind of a governance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    AutoApprove,
    UserApproval,
    AdminApproval,
    Deny,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::UserApproval => "user_approval",
            Self::AdminApproval => "admin_approval",
            Self::Deny => "deny",
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny)
    }

    /// Whether this decision still needs a human before execution.
    pub fn awaits_approval(&self) -> bool {
        matches!(self, Self::UserApproval | Self::AdminApproval)
    }
}

/// Context modifiers accompanying a proposed action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionContext {
    /// Risk attached by the proposer (escalates the tier by one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Caller trust score in [0, 1]; high trust can relax T2 to T1 for
    /// whitelisted action types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ActionContext {
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = Some(risk);
        self
    }

    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust_score = Some(trust.clamp(0.0, 1.0));
        self
    }
}

/// A proposed action submitted to the governance gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action_type: String,
    pub actor: String,
    pub resource: String,
    #[serde(default)]
    pub context: ActionContext,
}

impl ProposedAction {
    pub fn new(
        action_type: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            actor: actor.into(),
            resource: resource.into(),
            context: ActionContext::default(),
        }
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = context;
        self
    }
}

/// The gate's verdict on a proposed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub id: Uuid,
    pub decision: DecisionKind,
    pub tier: GovernanceTier,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    /// Deadline for user/admin approval before the decision becomes deny.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub approvers_required: u32,
}

impl GovernanceDecision {
    pub fn new(
        decision: DecisionKind,
        tier: GovernanceTier,
        reason: impl Into<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        let approvers_required = match decision {
            DecisionKind::AutoApprove | DecisionKind::Deny => 0,
            DecisionKind::UserApproval => 1,
            DecisionKind::AdminApproval => 1,
        };
        Self {
            id: Uuid::new_v4(),
            decision,
            tier,
            reason: reason.into(),
            decided_at,
            expires_at: None,
            approvers_required,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}
