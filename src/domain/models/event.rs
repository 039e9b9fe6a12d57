//! Event and trigger value objects.
//!
//! Events are immutable once published; idempotency is keyed on the ULID
//! `id`. Event types form a closed dotted taxonomy with a reserved `ext.*`
//! namespace for experimental producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed event taxonomy with stable dotted prefixes.
///
/// The bus carries strings on the wire; the publisher validates against this
/// taxonomy on ingress. `Ext` covers the reserved `ext.*` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    // boot.*
    BootPhaseStarted,
    BootPhaseOk,
    BootPhaseFailed,
    BootDegraded,
    SystemReady,
    SystemShutdown,

    // guardian.*
    GuardianScanStarted,
    GuardianScanCompleted,
    GuardianIssueDetected,
    GuardianPortAllocated,

    // healing.*
    HealingIncidentDetected,
    HealingIncidentResolved,
    HealingFailed,
    HealingStats,
    PlaybookProposed,

    // governance.*
    GovernanceDecision,
    GovernanceApprovalRequested,
    GovernanceApprovalExpired,

    // htm.task.* plus the externally injected cancel request
    HtmTaskCreated,
    HtmTaskDispatched,
    HtmTaskUpdate,
    HtmTaskRetrying,
    HtmTaskSucceeded,
    HtmTaskFailed,
    HtmTaskTimedOut,
    HtmTaskCancelled,
    TaskCancel,

    // audit.*
    AuditChainBroken,
    AuditDeadLetter,
    IncidentSchemaBroken,

    // config.*
    ConfigRevisionProposed,
    ConfigRevisionApplied,
    ConfigRevisionReverted,

    // kernel.*
    KernelRegistered,
    KernelHealthChanged,

    // bus.*
    BusSaturation,

    // meta.*
    MetaCycleCompleted,
    MetaProposalCreated,

    /// Reserved experimental namespace; the payload schema is unchecked.
    Ext(String),
}

impl EventType {
    /// The canonical dotted name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::BootPhaseStarted => "boot.phase.started",
            Self::BootPhaseOk => "boot.phase.ok",
            Self::BootPhaseFailed => "boot.phase.failed",
            Self::BootDegraded => "boot.degraded",
            Self::SystemReady => "system.ready",
            Self::SystemShutdown => "system.shutdown",
            Self::GuardianScanStarted => "guardian.scan.started",
            Self::GuardianScanCompleted => "guardian.scan.completed",
            Self::GuardianIssueDetected => "guardian.issue.detected",
            Self::GuardianPortAllocated => "guardian.port.allocated",
            Self::HealingIncidentDetected => "healing.incident.detected",
            Self::HealingIncidentResolved => "healing.incident.resolved",
            Self::HealingFailed => "healing.failed",
            Self::HealingStats => "healing.stats",
            Self::PlaybookProposed => "playbook.proposed",
            Self::GovernanceDecision => "governance.decision",
            Self::GovernanceApprovalRequested => "governance.approval.requested",
            Self::GovernanceApprovalExpired => "governance.approval.expired",
            Self::HtmTaskCreated => "htm.task.created",
            Self::HtmTaskDispatched => "htm.task.dispatched",
            Self::HtmTaskUpdate => "htm.task.update",
            Self::HtmTaskRetrying => "htm.task.retrying",
            Self::HtmTaskSucceeded => "htm.task.succeeded",
            Self::HtmTaskFailed => "htm.task.failed",
            Self::HtmTaskTimedOut => "htm.task.timed_out",
            Self::HtmTaskCancelled => "htm.task.cancelled",
            Self::TaskCancel => "task.cancel",
            Self::AuditChainBroken => "audit.chain.broken",
            Self::AuditDeadLetter => "audit.dead_letter",
            Self::IncidentSchemaBroken => "incident.schema.broken",
            Self::ConfigRevisionProposed => "config.revision.proposed",
            Self::ConfigRevisionApplied => "config.revision.applied",
            Self::ConfigRevisionReverted => "config.revision.reverted",
            Self::KernelRegistered => "kernel.registered",
            Self::KernelHealthChanged => "kernel.health.changed",
            Self::BusSaturation => "bus.saturation",
            Self::MetaCycleCompleted => "meta.cycle.completed",
            Self::MetaProposalCreated => "meta.proposal.created",
            Self::Ext(name) => name.as_str(),
        }
    }

    /// Parse a dotted name, validating against the closed taxonomy.
    ///
    /// Anything under `ext.` passes through; any other unknown name is
    /// rejected so typos cannot silently mint new event types.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let known = match s {
            "boot.phase.started" => Self::BootPhaseStarted,
            "boot.phase.ok" => Self::BootPhaseOk,
            "boot.phase.failed" => Self::BootPhaseFailed,
            "boot.degraded" => Self::BootDegraded,
            "system.ready" => Self::SystemReady,
            "system.shutdown" => Self::SystemShutdown,
            "guardian.scan.started" => Self::GuardianScanStarted,
            "guardian.scan.completed" => Self::GuardianScanCompleted,
            "guardian.issue.detected" => Self::GuardianIssueDetected,
            "guardian.port.allocated" => Self::GuardianPortAllocated,
            "healing.incident.detected" => Self::HealingIncidentDetected,
            "healing.incident.resolved" => Self::HealingIncidentResolved,
            "healing.failed" => Self::HealingFailed,
            "healing.stats" => Self::HealingStats,
            "playbook.proposed" => Self::PlaybookProposed,
            "governance.decision" => Self::GovernanceDecision,
            "governance.approval.requested" => Self::GovernanceApprovalRequested,
            "governance.approval.expired" => Self::GovernanceApprovalExpired,
            "htm.task.created" => Self::HtmTaskCreated,
            "htm.task.dispatched" => Self::HtmTaskDispatched,
            "htm.task.update" => Self::HtmTaskUpdate,
            "htm.task.retrying" => Self::HtmTaskRetrying,
            "htm.task.succeeded" => Self::HtmTaskSucceeded,
            "htm.task.failed" => Self::HtmTaskFailed,
            "htm.task.timed_out" => Self::HtmTaskTimedOut,
            "htm.task.cancelled" => Self::HtmTaskCancelled,
            "task.cancel" => Self::TaskCancel,
            "audit.chain.broken" => Self::AuditChainBroken,
            "audit.dead_letter" => Self::AuditDeadLetter,
            "incident.schema.broken" => Self::IncidentSchemaBroken,
            "config.revision.proposed" => Self::ConfigRevisionProposed,
            "config.revision.applied" => Self::ConfigRevisionApplied,
            "config.revision.reverted" => Self::ConfigRevisionReverted,
            "kernel.registered" => Self::KernelRegistered,
            "kernel.health.changed" => Self::KernelHealthChanged,
            "bus.saturation" => Self::BusSaturation,
            "meta.cycle.completed" => Self::MetaCycleCompleted,
            "meta.proposal.created" => Self::MetaProposalCreated,
            ext if ext.starts_with("ext.") && ext.len() > 4 => Self::Ext(ext.to_string()),
            other => return Err(DomainError::UnknownEventType(other.to_string())),
        };
        Ok(known)
    }

    /// Required payload fields checked by the publisher on ingress.
    ///
    /// Unknown fields are always ignored; a missing required field routes
    /// the event to a dead-letter audit entry instead of the bus.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::BootPhaseStarted | Self::BootPhaseOk => &["phase"],
            Self::BootPhaseFailed => &["phase", "reason"],
            Self::BootDegraded => &["failed_phase", "skipped_phases"],
            Self::GuardianIssueDetected => &["category"],
            Self::GuardianPortAllocated => &["port"],
            Self::HealingIncidentDetected | Self::HealingIncidentResolved => &["incident_id"],
            Self::HealingFailed => &["incident_id", "reason"],
            Self::PlaybookProposed => &["playbook_id", "required_tier"],
            Self::GovernanceDecision => &["decision", "tier", "reason"],
            Self::HtmTaskCreated
            | Self::HtmTaskDispatched
            | Self::HtmTaskRetrying
            | Self::HtmTaskSucceeded
            | Self::HtmTaskFailed
            | Self::HtmTaskTimedOut
            | Self::HtmTaskCancelled
            | Self::TaskCancel => &["task_id"],
            Self::HtmTaskUpdate => &["task_id", "state"],
            Self::AuditChainBroken => &["line"],
            Self::ConfigRevisionProposed | Self::ConfigRevisionApplied | Self::ConfigRevisionReverted => {
                &["version"]
            }
            Self::KernelRegistered => &["name"],
            Self::KernelHealthChanged => &["name", "health"],
            _ => &[],
        }
    }

    /// Default severity used when the producer does not override it.
    pub fn default_severity(&self) -> EventSeverity {
        match self {
            Self::BootPhaseFailed
            | Self::HealingFailed
            | Self::HtmTaskFailed
            | Self::HtmTaskTimedOut => EventSeverity::Error,
            Self::AuditChainBroken | Self::IncidentSchemaBroken => EventSeverity::Critical,
            Self::BootDegraded
            | Self::GuardianIssueDetected
            | Self::BusSaturation
            | Self::GovernanceApprovalExpired
            | Self::HtmTaskRetrying => EventSeverity::Warn,
            Self::HtmTaskUpdate | Self::GuardianScanStarted | Self::GuardianScanCompleted => {
                EventSeverity::Debug
            }
            _ => EventSeverity::Info,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Immutable event record flowing through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// ULID; idempotency key for subscribers.
    pub id: Ulid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Component that published this event.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub payload: Map<String, Value>,
    /// Wall-clock timestamp (ISO-8601 UTC on the wire).
    pub timestamp: DateTime<Utc>,
    /// Monotonic nanoseconds from the injected clock.
    pub monotonic_ns: u64,
    pub severity: EventSeverity,
}

impl Event {
    /// Read a payload field as a string slice.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Read a payload field as an unsigned integer.
    pub fn payload_u64(&self, field: &str) -> Option<u64> {
        self.payload.get(field).and_then(Value::as_u64)
    }
}

/// A trigger is an event that represents intent to change state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub actor: String,
    pub resource: String,
    pub action: String,
    #[serde(flatten)]
    pub event: Event,
}

impl TriggerEvent {
    /// Fold the trigger fields into the event payload so a trigger can ride
    /// the bus as a plain event.
    pub fn into_event(mut self) -> Event {
        self.event
            .payload
            .insert("actor".to_string(), Value::String(self.actor));
        self.event
            .payload
            .insert("resource".to_string(), Value::String(self.resource));
        self.event
            .payload
            .insert("action".to_string(), Value::String(self.action));
        self.event
    }
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// Both the audit chain hash and the publisher's payload stamping use this
/// so the same logical event always yields the same bytes.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    // Keys and scalars round-trip through serde_json so string
                    // escaping stays consistent with the non-canonical form.
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&serde_json::to_string(scalar).unwrap_or_default()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_taxonomy_round_trip() {
        for name in [
            "boot.phase.failed",
            "guardian.issue.detected",
            "healing.incident.resolved",
            "governance.decision",
            "htm.task.update",
            "task.cancel",
            "audit.chain.broken",
            "config.revision.applied",
            "kernel.health.changed",
            "bus.saturation",
            "meta.proposal.created",
            "system.ready",
        ] {
            let parsed = EventType::parse(name).unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            EventType::parse("healing.made.up"),
            Err(DomainError::UnknownEventType(_))
        ));
        assert!(matches!(
            EventType::parse("totally.unknown"),
            Err(DomainError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_ext_namespace_passes() {
        let parsed = EventType::parse("ext.experiment.alpha").unwrap();
        assert_eq!(parsed, EventType::Ext("ext.experiment.alpha".to_string()));
        // Bare "ext." is not a valid name.
        assert!(EventType::parse("ext.").is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(EventSeverity::Debug < EventSeverity::Info);
        assert!(EventSeverity::Warn < EventSeverity::Error);
        assert!(EventSeverity::Error < EventSeverity::Critical);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_is_stable_across_insertion_order() {
        let left = json!({"x": 1, "y": 2});
        let right = json!({"y": 2, "x": 1});
        assert_eq!(canonical_json(&left), canonical_json(&right));
    }

    #[test]
    fn test_trigger_folds_into_payload() {
        let event = Event {
            id: Ulid::new(),
            event_type: EventType::TaskCancel,
            source: "operator".to_string(),
            correlation_id: None,
            payload: Map::new(),
            timestamp: Utc::now(),
            monotonic_ns: 0,
            severity: EventSeverity::Info,
        };
        let trigger = TriggerEvent {
            actor: "admin".to_string(),
            resource: "task:1234".to_string(),
            action: "cancel".to_string(),
            event,
        };
        let folded = trigger.into_event();
        assert_eq!(folded.payload_str("actor"), Some("admin"));
        assert_eq!(folded.payload_str("action"), Some("cancel"));
    }

    #[test]
    fn test_event_type_serde_as_string() {
        let t = EventType::GovernanceDecision;
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"governance.decision\"");
        let back: EventType = serde_json::from_str("\"governance.decision\"").unwrap();
        assert_eq!(back, t);
    }
}
