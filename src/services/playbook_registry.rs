//! Playbook registry and the builtin healing playbooks.
//!
//! This file is the single canonical mapping from failure modes to
//! remediation procedures. Registration enforces the execution contract:
//! every step and every playbook must declare a verification rule.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::Event;
use crate::domain::models::governance::GovernanceTier;
use crate::domain::models::incident::FailureMode;
use crate::domain::models::playbook::{
    AutonomyTier, PayloadPredicate, Playbook, PlaybookStep, RiskLevel, TriggerMatch, Verification,
};
use crate::services::event_bus::prefix_matches;

/// The playbook registry service.
pub struct PlaybookRegistry {
    playbooks: RwLock<HashMap<String, Playbook>>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self {
            playbooks: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the builtin healing playbooks.
    pub async fn with_builtins() -> DomainResult<Self> {
        let registry = Self::new();
        for playbook in builtin_playbooks() {
            registry.register(playbook).await?;
        }
        Ok(registry)
    }

    /// Register a playbook. An action without a verification rule is
    /// rejected here, before it can ever run.
    pub async fn register(&self, playbook: Playbook) -> DomainResult<()> {
        playbook.validate().map_err(DomainError::ValidationFailed)?;
        info!(playbook = %playbook.id, risk = playbook.risk_level.as_str(), "playbook registered");
        self.playbooks
            .write()
            .await
            .insert(playbook.id.clone(), playbook);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Playbook> {
        self.playbooks.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Playbook> {
        let mut all: Vec<Playbook> = self.playbooks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Playbooks declaring a given failure mode.
    pub async fn for_failure_mode(&self, mode: FailureMode) -> Vec<Playbook> {
        let mut found: Vec<Playbook> = self
            .playbooks
            .read()
            .await
            .values()
            .filter(|p| p.failure_modes.contains(&mode))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Playbooks whose trigger rules match an event.
    pub async fn matching_event(&self, event: &Event) -> Vec<Playbook> {
        let type_str = event.event_type.as_str();
        let mut found: Vec<Playbook> = self
            .playbooks
            .read()
            .await
            .values()
            .filter(|p| {
                p.triggers_on.iter().any(|t| {
                    prefix_matches(&t.event_prefix, type_str)
                        && t.predicates.iter().all(|pred| pred.matches(&event.payload))
                })
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Action types of playbooks safe for unattended execution; wired into
    /// the governance whitelist at boot.
    pub async fn auto_approvable_action_types(&self) -> Vec<String> {
        self.playbooks
            .read()
            .await
            .values()
            .filter(|p| p.autonomy_tier == AutonomyTier::Tier1 && p.risk_level == RiskLevel::Low)
            .map(|p| p.action_type.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.playbooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.playbooks.read().await.is_empty()
    }
}

impl Default for PlaybookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Governance tier a playbook proposal requires.
///
/// The autonomy tier sets the floor (1 -> T1, 2 -> T2, 3 -> T3); high or
/// critical risk escalates one tier on top.
pub fn required_tier(playbook: &Playbook) -> GovernanceTier {
    let base = match playbook.autonomy_tier {
        AutonomyTier::Tier1 => GovernanceTier::T1,
        AutonomyTier::Tier2 => GovernanceTier::T2,
        AutonomyTier::Tier3 => GovernanceTier::T3,
    };
    match playbook.risk_level {
        RiskLevel::High | RiskLevel::Critical => base.escalate(),
        RiskLevel::Low | RiskLevel::Medium => base,
    }
}

fn detection_trigger(mode: FailureMode) -> TriggerMatch {
    TriggerMatch::prefix("guardian.issue.detected").with_predicate(PayloadPredicate::Eq {
        field: "category".to_string(),
        value: json!(mode.as_str()),
    })
}

fn scan_clear(mode: FailureMode) -> Verification {
    let mut v = Verification::action("verify.scan_clear");
    v.inputs.insert("category".to_string(), json!(mode.as_str()));
    v
}

/// The canonical builtin playbooks, one per watchdog failure mode.
pub fn builtin_playbooks() -> Vec<Playbook> {
    vec![
        Playbook::new(
            "zombie_process.kill_and_release",
            "Reap a defunct process and free any port it still holds",
        )
        .remediates(FailureMode::ZombieProcess)
        .triggered_by(detection_trigger(FailureMode::ZombieProcess))
        .with_step(
            PlaybookStep::new("kill_zombie", "probe.kill_process")
                .verified_by(scan_clear(FailureMode::ZombieProcess)),
        )
        .with_verification(scan_clear(FailureMode::ZombieProcess))
        .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
        //
        Playbook::new("port_conflict.rebind", "Release a contended port and rebind")
            .remediates(FailureMode::PortInUse)
            .triggered_by(detection_trigger(FailureMode::PortInUse))
            .with_step(
                PlaybookStep::new("release_port", "probe.release_port")
                    .verified_by(Verification::action("verify.port_free")),
            )
            .with_verification(Verification::action("verify.port_free"))
            .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
        //
        Playbook::new(
            "time_wait.backoff_and_tune",
            "Tune socket reuse to drain a TIME_WAIT buildup",
        )
        .remediates(FailureMode::TimeWaitBuildup)
        .triggered_by(detection_trigger(FailureMode::TimeWaitBuildup))
        .with_step(
            PlaybookStep::new("tune_reuse", "probe.tune_time_wait_reuse")
                .verified_by(scan_clear(FailureMode::TimeWaitBuildup)),
        )
        .with_verification(scan_clear(FailureMode::TimeWaitBuildup))
        .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
        //
        Playbook::new(
            "close_wait.reap_leaked_sockets",
            "Close sockets stuck in CLOSE_WAIT",
        )
        .remediates(FailureMode::CloseWaitLeak)
        .triggered_by(detection_trigger(FailureMode::CloseWaitLeak))
        .with_step(
            PlaybookStep::new("reap_sockets", "probe.reap_close_wait")
                .verified_by(scan_clear(FailureMode::CloseWaitLeak)),
        )
        .with_verification(scan_clear(FailureMode::CloseWaitLeak))
        .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
        //
        Playbook::new(
            "ephemeral_exhaustion.widen_range",
            "Widen the ephemeral port range under exhaustion",
        )
        .remediates(FailureMode::EphemeralPortExhaustion)
        .triggered_by(detection_trigger(FailureMode::EphemeralPortExhaustion))
        .with_step(
            PlaybookStep::new("widen_range", "probe.widen_ephemeral_range")
                .verified_by(scan_clear(FailureMode::EphemeralPortExhaustion)),
        )
        .with_verification(scan_clear(FailureMode::EphemeralPortExhaustion))
        .with_risk(RiskLevel::Medium, AutonomyTier::Tier2),
        //
        Playbook::new(
            "fd_pressure.shed_and_raise",
            "Shed cached descriptors under fd pressure",
        )
        .remediates(FailureMode::FdPressure)
        .triggered_by(detection_trigger(FailureMode::FdPressure))
        .with_step(
            PlaybookStep::new("shed_descriptors", "probe.shed_descriptors")
                .verified_by(scan_clear(FailureMode::FdPressure)),
        )
        .with_verification(scan_clear(FailureMode::FdPressure))
        .with_risk(RiskLevel::Medium, AutonomyTier::Tier2),
        //
        Playbook::new("interface_flap.reprobe", "Re-probe a flapping interface")
            .remediates(FailureMode::InterfaceFlap)
            .triggered_by(detection_trigger(FailureMode::InterfaceFlap))
            .with_step(
                PlaybookStep::new("reprobe", "probe.reprobe_interface")
                    .verified_by(scan_clear(FailureMode::InterfaceFlap)),
            )
            .with_verification(scan_clear(FailureMode::InterfaceFlap))
            .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
        //
        Playbook::new(
            "dns_failure.flush_and_failover",
            "Flush the resolver cache and fail over",
        )
        .remediates(FailureMode::DnsFailure)
        .triggered_by(detection_trigger(FailureMode::DnsFailure))
        .with_step(
            PlaybookStep::new("flush_dns", "probe.flush_dns")
                .verified_by(scan_clear(FailureMode::DnsFailure)),
        )
        .with_verification(scan_clear(FailureMode::DnsFailure))
        .with_risk(RiskLevel::Low, AutonomyTier::Tier1),
    ]
}

/// Pick the preferred playbook among candidates for one failure mode:
/// highest historical success rate first, then lowest risk, then id.
pub fn rank_candidates(
    mut candidates: Vec<Playbook>,
    success_rates: &HashMap<String, f64>,
) -> Vec<Playbook> {
    candidates.sort_by(|a, b| {
        let rate_a = success_rates.get(&a.id).copied().unwrap_or(0.5);
        let rate_b = success_rates.get(&b.id).copied().unwrap_or(0.5);
        rate_b
            .partial_cmp(&rate_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.risk_level.cmp(&b.risk_level))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// Shared handle type used across services.
pub type SharedPlaybookRegistry = Arc<PlaybookRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::{EventSeverity, EventType};
    use chrono::Utc;
    use serde_json::Map;
    use ulid::Ulid;

    #[tokio::test]
    async fn test_builtins_cover_every_failure_mode() {
        let registry = PlaybookRegistry::with_builtins().await.unwrap();
        assert_eq!(registry.len().await, 8);
        for mode in FailureMode::ALL {
            let found = registry.for_failure_mode(mode).await;
            assert!(!found.is_empty(), "no playbook for {mode}");
        }
    }

    #[tokio::test]
    async fn test_unverified_step_rejected() {
        let registry = PlaybookRegistry::new();
        let bad = Playbook::new("bad.playbook", "no verification")
            .with_step(PlaybookStep::new("s", "probe.flush_dns"))
            .with_verification(Verification::action("verify.scan_clear"));
        let err = registry.register(bad).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_event_matching_with_predicates() {
        let registry = PlaybookRegistry::with_builtins().await.unwrap();
        let mut payload = Map::new();
        payload.insert("category".to_string(), json!("zombie_process"));
        let event = Event {
            id: Ulid::new(),
            event_type: EventType::GuardianIssueDetected,
            source: "guardian".to_string(),
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
            monotonic_ns: 0,
            severity: EventSeverity::Warn,
        };

        let matched = registry.matching_event(&event).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "zombie_process.kill_and_release");
    }

    #[tokio::test]
    async fn test_required_tier_mapping() {
        let registry = PlaybookRegistry::with_builtins().await.unwrap();
        let zombie = registry.get("zombie_process.kill_and_release").await.unwrap();
        assert_eq!(required_tier(&zombie), GovernanceTier::T1);

        let widen = registry.get("ephemeral_exhaustion.widen_range").await.unwrap();
        assert_eq!(required_tier(&widen), GovernanceTier::T2);

        let risky = Playbook::new("x", "x").with_risk(RiskLevel::Critical, AutonomyTier::Tier2);
        assert_eq!(required_tier(&risky), GovernanceTier::T3);
    }

    #[tokio::test]
    async fn test_auto_approvable_action_types() {
        let registry = PlaybookRegistry::with_builtins().await.unwrap();
        let whitelist = registry.auto_approvable_action_types().await;
        assert!(whitelist.contains(&"heal.zombie_process.kill_and_release".to_string()));
        // Tier-2 playbooks never end up on the whitelist.
        assert!(!whitelist.contains(&"heal.ephemeral_exhaustion.widen_range".to_string()));
    }

    #[test]
    fn test_rank_candidates_by_success_rate() {
        let a = Playbook::new("a", "").with_risk(RiskLevel::Medium, AutonomyTier::Tier1);
        let b = Playbook::new("b", "").with_risk(RiskLevel::Low, AutonomyTier::Tier1);
        let mut rates = HashMap::new();
        rates.insert("a".to_string(), 0.9);
        rates.insert("b".to_string(), 0.4);

        let ranked = rank_candidates(vec![b.clone(), a.clone()], &rates);
        assert_eq!(ranked[0].id, "a");

        // Without history both sit at 0.5 and lower risk wins.
        let ranked = rank_candidates(vec![a, b], &HashMap::new());
        assert_eq!(ranked[0].id, "b");
    }
}
