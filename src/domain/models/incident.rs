//! Incident domain model.
//!
//! Incidents track a detected issue from first sighting to a terminal state.
//! Terminal states never mutate; MTTR is fixed exactly once, on the
//! transition to `Resolved`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::event::EventSeverity;

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    InProgress,
    Resolved,
    Failed,
    Escalated,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Escalated)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [IncidentStatus] {
        match self {
            Self::Detected => &[Self::InProgress, Self::Failed, Self::Escalated],
            Self::InProgress => &[Self::Resolved, Self::Failed, Self::Escalated],
            Self::Resolved | Self::Failed | Self::Escalated => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// The canonical failure-mode taxonomy shared by the guardian's watchdog
/// categories and the playbook registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    PortInUse,
    TimeWaitBuildup,
    EphemeralPortExhaustion,
    ZombieProcess,
    CloseWaitLeak,
    FdPressure,
    InterfaceFlap,
    DnsFailure,
}

impl FailureMode {
    pub const ALL: [FailureMode; 8] = [
        Self::PortInUse,
        Self::TimeWaitBuildup,
        Self::EphemeralPortExhaustion,
        Self::ZombieProcess,
        Self::CloseWaitLeak,
        Self::FdPressure,
        Self::InterfaceFlap,
        Self::DnsFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortInUse => "port_in_use",
            Self::TimeWaitBuildup => "time_wait_buildup",
            Self::EphemeralPortExhaustion => "ephemeral_port_exhaustion",
            Self::ZombieProcess => "zombie_process",
            Self::CloseWaitLeak => "close_wait_leak",
            Self::FdPressure => "fd_pressure",
            Self::InterfaceFlap => "interface_flap",
            Self::DnsFailure => "dns_failure",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "port_in_use" => Some(Self::PortInUse),
            "time_wait_buildup" => Some(Self::TimeWaitBuildup),
            "ephemeral_port_exhaustion" => Some(Self::EphemeralPortExhaustion),
            "zombie_process" => Some(Self::ZombieProcess),
            "close_wait_leak" => Some(Self::CloseWaitLeak),
            "fd_pressure" => Some(Self::FdPressure),
            "interface_flap" => Some(Self::InterfaceFlap),
            "dns_failure" => Some(Self::DnsFailure),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remediation step that was actually executed against an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTaken {
    pub action: String,
    pub at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Incident lifecycle entity, owned exclusively by the incident log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: IncidentStatus,
    pub failure_mode: FailureMode,
    pub severity: EventSeverity,
    #[serde(default)]
    pub actions_taken: Vec<ActionTaken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mttr_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook_id: Option<String>,
    /// Free-form detail from the detection (port number, pid, iface name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Incident {
    pub fn new(failure_mode: FailureMode, severity: EventSeverity, detected_at: DateTime<Utc>) -> Self {
        Self {
            incident_id: Uuid::new_v4(),
            detected_at,
            resolved_at: None,
            status: IncidentStatus::Detected,
            failure_mode,
            severity,
            actions_taken: Vec::new(),
            mttr_seconds: None,
            playbook_id: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_playbook(mut self, playbook_id: impl Into<String>) -> Self {
        self.playbook_id = Some(playbook_id.into());
        self
    }

    /// Transition to `Resolved`, fixing `resolved_at` and MTTR.
    ///
    /// Rejects terminal states and clocks that would produce a negative MTTR.
    pub fn resolve(&mut self, at: DateTime<Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(IncidentStatus::Resolved) {
            return Err(format!(
                "cannot resolve incident in state {}",
                self.status.as_str()
            ));
        }
        if at < self.detected_at {
            return Err("resolved_at precedes detected_at".to_string());
        }
        self.status = IncidentStatus::Resolved;
        self.resolved_at = Some(at);
        self.mttr_seconds = Some((at - self.detected_at).num_milliseconds() as f64 / 1000.0);
        Ok(())
    }

    /// Transition to a non-resolved terminal or intermediate state.
    pub fn transition(&mut self, next: IncidentStatus) -> Result<(), String> {
        if next == IncidentStatus::Resolved {
            return Err("use resolve() for the resolved transition".to_string());
        }
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "invalid incident transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn record_action(&mut self, action: impl Into<String>, at: DateTime<Utc>, succeeded: bool) {
        self.actions_taken.push(ActionTaken {
            action: action.into(),
            at,
            succeeded,
            detail: None,
        });
    }
}
