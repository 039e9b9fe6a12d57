//! Playbook domain model.
//!
//! Playbooks are declarative remediation procedures: ordered steps, each
//! with a mandatory verification predicate and an optional compensating
//! action used for rollback.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::models::incident::FailureMode;

/// Risk classification of a playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Autonomy tier: 1 = may run unattended, 3 = always needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyTier {
    Tier1,
    Tier2,
    Tier3,
}

impl AutonomyTier {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Tier1 => 1,
            Self::Tier2 => 2,
            Self::Tier3 => 3,
        }
    }
}

/// Predicate over a payload field, used by trigger matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PayloadPredicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gte { field: String, value: f64 },
    Lte { field: String, value: f64 },
}

impl PayloadPredicate {
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        match self {
            Self::Eq { field, value } => payload.get(field) == Some(value),
            Self::Ne { field, value } => payload.get(field) != Some(value),
            Self::Gte { field, value } => payload
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|v| v >= *value),
            Self::Lte { field, value } => payload
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|v| v <= *value),
        }
    }
}

/// A matching rule binding event types (and payload shape) to a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMatch {
    /// Dotted event-type prefix this rule listens on.
    pub event_prefix: String,
    #[serde(default)]
    pub predicates: Vec<PayloadPredicate>,
}

impl TriggerMatch {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            event_prefix: prefix.into(),
            predicates: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: PayloadPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// Verification predicate: an action routed through the kernel registry
/// whose result must report success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub action: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl Verification {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            inputs: Map::new(),
        }
    }
}

/// One ordered step of a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub name: String,
    /// Intent routed through the kernel registry.
    pub action: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Mandatory; registration rejects steps without one.
    pub verification: Option<Verification>,
    /// Compensating action run in reverse order on rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Verification>,
    /// Whether a timed-out or transiently failed step is retry-eligible.
    #[serde(default = "default_true")]
    pub retry: bool,
}

fn default_true() -> bool {
    true
}

impl PlaybookStep {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            inputs: Map::new(),
            verification: None,
            compensation: None,
            retry: true,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn verified_by(mut self, verification: Verification) -> Self {
        self.verification = Some(verification);
        self
    }

    pub fn compensated_by(mut self, compensation: Verification) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// Declarative remediation/automation procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Stable id, e.g. `zombie_process.kill_and_release`.
    pub id: String,
    pub description: String,
    pub triggers_on: Vec<TriggerMatch>,
    /// Failure modes this playbook remediates.
    #[serde(default)]
    pub failure_modes: Vec<FailureMode>,
    /// Preconditions verified before step 1 (same shape as verifications).
    #[serde(default)]
    pub preconditions: Vec<Verification>,
    pub steps: Vec<PlaybookStep>,
    /// Playbook-level verifications run after the last step.
    #[serde(default)]
    pub verifications: Vec<Verification>,
    pub risk_level: RiskLevel,
    pub autonomy_tier: AutonomyTier,
    /// Whether compensations run on step failure.
    #[serde(default)]
    pub rollback: bool,
    /// Action type submitted to governance for this playbook.
    pub action_type: String,
}

impl Playbook {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            action_type: format!("heal.{id}"),
            id,
            description: description.into(),
            triggers_on: Vec::new(),
            failure_modes: Vec::new(),
            preconditions: Vec::new(),
            steps: Vec::new(),
            verifications: Vec::new(),
            risk_level: RiskLevel::Low,
            autonomy_tier: AutonomyTier::Tier1,
            rollback: false,
        }
    }

    pub fn remediates(mut self, mode: FailureMode) -> Self {
        self.failure_modes.push(mode);
        self
    }

    pub fn triggered_by(mut self, m: TriggerMatch) -> Self {
        self.triggers_on.push(m);
        self
    }

    pub fn with_step(mut self, step: PlaybookStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_verification(mut self, v: Verification) -> Self {
        self.verifications.push(v);
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel, tier: AutonomyTier) -> Self {
        self.risk_level = risk;
        self.autonomy_tier = tier;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    /// Every step and the playbook itself must carry a verification rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("playbook id is empty".to_string());
        }
        if self.steps.is_empty() {
            return Err(format!("playbook {} has no steps", self.id));
        }
        for step in &self.steps {
            if step.verification.is_none() {
                return Err(format!(
                    "playbook {} step '{}' has no verification rule",
                    self.id, step.name
                ));
            }
        }
        if self.verifications.is_empty() {
            return Err(format!("playbook {} has no playbook-level verification", self.id));
        }
        Ok(())
    }
}
