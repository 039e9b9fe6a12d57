//! Boot orchestrator: deterministic staged startup.
//!
//! Phases are data, not control flow: an ordered table with a timeout per
//! phase, each phase mapped to a start routine with a health check. A
//! failure in a gate phase aborts boot with its exit code; a failure in a
//! later phase halts the remaining phases and enters degraded-boot mode.
//! A successful boot publishes `system.ready` exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::GraceConfig;
use crate::domain::models::event::EventType;
use crate::domain::ports::approvals::ApprovalChannel;
use crate::domain::ports::clock::Clock;
use crate::domain::ports::probe::SystemProbe;
use crate::services::audit_log::AuditLog;
use crate::services::builtin_kernels::{InfrastructureKernel, SelfHealingKernel};
use crate::services::event_bus::EventBus;
use crate::services::governance::GovernanceGate;
use crate::services::guardian::Guardian;
use crate::services::healer::Healer;
use crate::services::healing_orchestrator::{
    HealingConfig, HealingOrchestrator, PlaybookRunner, PLAYBOOK_TASK_KIND,
};
use crate::services::htm_scheduler::HtmScheduler;
use crate::services::incident_log::IncidentLog;
use crate::services::kernel_registry::KernelRegistry;
use crate::services::meta_loop::{ConfigStore, MetaLoop, REVISION_ACTION_TYPE};
use crate::services::playbook_registry::PlaybookRegistry;
use crate::services::publisher::{PublishOpts, UnifiedPublisher};
use crate::services::trigger_mesh::{TriggerMesh, TriggerMeshConfig};

/// One entry of the boot phase table.
#[derive(Debug, Clone, Copy)]
pub struct BootPhase {
    pub id: u8,
    pub name: &'static str,
    pub timeout: Duration,
}

/// The ordered boot phases. Earlier phases gate everything after them.
pub const BOOT_PHASES: [BootPhase; 9] = [
    BootPhase { id: 1, name: "config", timeout: Duration::from_secs(5) },
    BootPhase { id: 2, name: "audit_log", timeout: Duration::from_secs(30) },
    BootPhase { id: 3, name: "event_bus", timeout: Duration::from_secs(5) },
    BootPhase { id: 4, name: "guardian_gate", timeout: Duration::from_secs(30) },
    BootPhase { id: 5, name: "kernel_registry", timeout: Duration::from_secs(10) },
    BootPhase { id: 6, name: "trigger_mesh", timeout: Duration::from_secs(10) },
    BootPhase { id: 7, name: "htm_scheduler", timeout: Duration::from_secs(10) },
    BootPhase { id: 8, name: "healing_orchestrator", timeout: Duration::from_secs(10) },
    BootPhase { id: 9, name: "meta_loop", timeout: Duration::from_secs(10) },
];

/// Fatal boot failures with their process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("boot gate failed: {0}")]
    GateFailed(String),
    #[error("audit chain broken at startup: {0}")]
    AuditChainBroken(String),
    #[error("fatal HTM inconsistency: {0}")]
    HtmInconsistent(String),
    #[error("boot failed in phase {phase}: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },
}

impl BootError {
    /// Process exit code mandated for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::GateFailed(_) => 3,
            Self::AuditChainBroken(_) => 4,
            Self::HtmInconsistent(_) => 5,
            Self::PhaseFailed { .. } => 1,
        }
    }
}

/// Terminal boot state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    Ready,
    Degraded {
        failed_phase: &'static str,
        skipped_phases: Vec<&'static str>,
    },
}

/// Everything the composition root built; handed to the binary.
pub struct ControlPlane {
    pub config: GraceConfig,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub publisher: Arc<UnifiedPublisher>,
    pub incidents: Arc<IncidentLog>,
    pub governance: Arc<GovernanceGate>,
    pub kernels: Arc<KernelRegistry>,
    pub playbooks: Arc<PlaybookRegistry>,
    pub mesh: Arc<TriggerMesh>,
    pub scheduler: Arc<HtmScheduler>,
    pub orchestrator: Arc<HealingOrchestrator>,
    pub guardian: Arc<Guardian>,
    pub healer: Arc<Healer>,
    pub meta: Arc<MetaLoop>,
    pub store: Arc<ConfigStore>,
    pub state: BootState,
    pub port: u16,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("state", &self.state)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Orderly shutdown in reverse phase order; drains the audit writer.
    pub async fn shutdown(&self) {
        let _ = self
            .publisher
            .publish_typed(
                EventType::SystemShutdown,
                Map::new(),
                "boot",
                PublishOpts::default(),
            )
            .await;
        self.meta.stop().await;
        self.healer.stop().await;
        self.orchestrator.stop().await;
        self.scheduler.stop().await;
        self.mesh.stop().await;
        self.bus.close().await;
        self.audit.shutdown().await;
        info!("control plane shut down");
    }
}

/// Drives the phased boot.
pub struct BootOrchestrator {
    config: GraceConfig,
    probe: Arc<dyn SystemProbe>,
    approvals: Arc<dyn ApprovalChannel>,
    clock: Arc<dyn Clock>,
}

impl BootOrchestrator {
    pub fn new(
        config: GraceConfig,
        probe: Arc<dyn SystemProbe>,
        approvals: Arc<dyn ApprovalChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            probe,
            approvals,
            clock,
        }
    }

    /// Run all phases. Gate failures (audit chain, port gate) return a
    /// `BootError` carrying the mandated exit code; failures after the
    /// publisher exists degrade the boot instead.
    pub async fn boot(self) -> Result<ControlPlane, BootError> {
        // Phase events raised before the publisher exists are buffered and
        // flushed right after phase 3 brings the bus up.
        let mut early_events: Vec<(EventType, Map<String, Value>)> = Vec::new();

        // ---- Phase 1: config -------------------------------------------------
        let phase = BOOT_PHASES[0];
        early_events.push(phase_event(EventType::BootPhaseStarted, phase, None));
        if self.config.guardian.port_scan_start >= self.config.guardian.port_scan_end {
            return Err(BootError::PhaseFailed {
                phase: phase.name,
                reason: "empty guardian port scan range".to_string(),
            });
        }
        early_events.push(phase_event(EventType::BootPhaseOk, phase, None));

        // ---- Phase 2: audit log + chain verification ------------------------
        let phase = BOOT_PHASES[1];
        early_events.push(phase_event(EventType::BootPhaseStarted, phase, None));
        let audit_path = self.config.paths.audit_log();
        let verification = AuditLog::verify_chain(&audit_path)
            .await
            .map_err(|e| BootError::AuditChainBroken(e.to_string()))?;
        let mut chain_broken: Option<(usize, String)> = None;
        if let Some((line, detail)) = verification.broken_at {
            if !self.config.allow_degraded_start {
                return Err(BootError::AuditChainBroken(format!(
                    "line {line}: {detail}"
                )));
            }
            warn!(line, detail = %detail, "audit chain broken; continuing degraded");
            chain_broken = Some((line, detail));
        }
        let audit = Arc::new(
            AuditLog::open(&audit_path)
                .await
                .map_err(|e| BootError::AuditChainBroken(e.to_string()))?,
        );
        if chain_broken.is_some() {
            audit.mark_degraded();
        }
        early_events.push(phase_event(EventType::BootPhaseOk, phase, None));

        // ---- Phase 3: event bus + unified publisher -------------------------
        let phase = BOOT_PHASES[2];
        early_events.push(phase_event(EventType::BootPhaseStarted, phase, None));
        let bus = Arc::new(EventBus::new(self.config.bus.clone()));
        let publisher = Arc::new(UnifiedPublisher::new(
            Arc::clone(&bus),
            Arc::clone(&audit),
            Arc::clone(&self.clock),
        ));
        early_events.push(phase_event(EventType::BootPhaseOk, phase, None));
        for (event_type, payload) in early_events.drain(..) {
            let _ = publisher
                .publish_typed(event_type, payload, "boot", PublishOpts::default())
                .await;
        }
        if let Some((line, detail)) = &chain_broken {
            let mut payload = Map::new();
            payload.insert("line".to_string(), json!(line));
            payload.insert("detail".to_string(), json!(detail));
            let _ = publisher
                .publish_typed(
                    EventType::AuditChainBroken,
                    payload,
                    "boot",
                    PublishOpts::default(),
                )
                .await;
        }

        // ---- Phase 4: guardian boot gate ------------------------------------
        let phase = BOOT_PHASES[3];
        publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
        let offline = self.config.offline_mode || self.config.ci_mode;
        let guardian = Arc::new(Guardian::new(
            self.config.guardian.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&publisher),
            offline,
        ));
        let port = match tokio::time::timeout(phase.timeout, guardian.boot_gate(self.config.port))
            .await
        {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                publish_phase(
                    &publisher,
                    EventType::BootPhaseFailed,
                    phase,
                    Some(e.to_string()),
                )
                .await;
                return Err(BootError::GateFailed(e.to_string()));
            }
            Err(_) => {
                let reason = "boot gate timed out".to_string();
                publish_phase(
                    &publisher,
                    EventType::BootPhaseFailed,
                    phase,
                    Some(reason.clone()),
                )
                .await;
                return Err(BootError::GateFailed(reason));
            }
        };
        publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;

        // Components are constructed eagerly; the remaining phases start
        // them. A phase failure leaves the rest constructed but not started.
        let incidents = Arc::new(
            IncidentLog::open(self.config.paths.incident_log())
                .await
                .map_err(|e| BootError::PhaseFailed {
                    phase: "audit_log",
                    reason: e.to_string(),
                })?,
        );
        let kernels = Arc::new(KernelRegistry::new().with_publisher(Arc::clone(&publisher)));
        let playbooks = Arc::new(PlaybookRegistry::new());

        let mut governance_config = self.config.governance.clone();
        governance_config
            .whitelisted_toggles
            .push(REVISION_ACTION_TYPE.to_string());
        // The builtin whitelist is completed in phase 6 once playbooks load.
        let governance_config_base = governance_config.clone();

        let mut state = BootState::Ready;
        let mut failed_phase: Option<&'static str> = None;

        // ---- Phase 5: kernel registry ---------------------------------------
        let phase = BOOT_PHASES[4];
        publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
        let phase5 = async {
            kernels
                .register(Arc::new(SelfHealingKernel::new(Arc::clone(&self.probe))))
                .await?;
            kernels.register(Arc::new(InfrastructureKernel)).await?;
            if kernels.is_empty().await {
                return Err(DomainError::ValidationFailed("no kernels registered".into()));
            }
            Ok::<(), DomainError>(())
        };
        if let Err(reason) = run_phase(phase, phase5).await {
            publish_phase(&publisher, EventType::BootPhaseFailed, phase, Some(reason)).await;
            failed_phase = Some(phase.name);
        } else {
            publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;
        }

        // ---- Phase 6: trigger mesh + playbook registry + governance ---------
        let mut governance = Arc::new(GovernanceGate::new(
            governance_config_base.clone(),
            Arc::clone(&self.approvals),
            Arc::clone(&publisher),
        ));
        let mesh = Arc::new(TriggerMesh::new(
            Arc::clone(&playbooks),
            Arc::clone(&publisher),
            Arc::clone(&bus),
            TriggerMeshConfig::default(),
        ));
        if failed_phase.is_none() {
            let phase = BOOT_PHASES[5];
            publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
            let phase6 = async {
                for playbook in crate::services::playbook_registry::builtin_playbooks() {
                    playbooks.register(playbook).await?;
                }
                let mut config = governance_config_base.clone();
                config
                    .whitelisted_toggles
                    .extend(playbooks.auto_approvable_action_types().await);
                governance = Arc::new(GovernanceGate::new(
                    config,
                    Arc::clone(&self.approvals),
                    Arc::clone(&publisher),
                ));
                mesh.start().await;
                Ok::<(), DomainError>(())
            };
            if let Err(reason) = run_phase(phase, phase6).await {
                publish_phase(&publisher, EventType::BootPhaseFailed, phase, Some(reason)).await;
                failed_phase = Some(phase.name);
            } else {
                publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;
            }
        }

        // ---- Phase 7: HTM scheduler -----------------------------------------
        let scheduler = Arc::new(
            HtmScheduler::new(self.config.htm.clone(), Arc::clone(&publisher))
                .with_journal(self.config.paths.task_journal())
                .await
                .map_err(|e| match e {
                    DomainError::HtmInconsistency(detail) => BootError::HtmInconsistent(detail),
                    other => BootError::PhaseFailed {
                        phase: "htm_scheduler",
                        reason: other.to_string(),
                    },
                })?,
        );
        if failed_phase.is_none() {
            let phase = BOOT_PHASES[6];
            publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
            scheduler
                .register_executor(
                    PLAYBOOK_TASK_KIND,
                    Arc::new(PlaybookRunner::new(
                        Arc::clone(&playbooks),
                        Arc::clone(&kernels),
                    )),
                )
                .await;
            scheduler.start().await;
            publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;
        }

        // ---- Phase 8: healing orchestrator + healer -------------------------
        let orchestrator = Arc::new(HealingOrchestrator::new(
            HealingConfig {
                task_sla_ms: self.config.htm.default_sla_ms,
                max_attempts: self.config.htm.max_attempts,
            },
            Arc::clone(&incidents),
            Arc::clone(&playbooks),
            Arc::clone(&governance),
            Arc::clone(&scheduler),
            Arc::clone(&publisher),
        ));
        let healer = Arc::new(Healer::new(
            Arc::clone(&guardian),
            Arc::clone(&publisher),
            self.config.guardian.scan_interval_ms,
        ));
        if failed_phase.is_none() {
            let phase = BOOT_PHASES[7];
            publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
            orchestrator.start().await;
            healer.start().await;
            publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;
        }

        // ---- Phase 9: meta loop ---------------------------------------------
        let store = Arc::new(
            ConfigStore::open(self.config.paths.revisions_dir(), tunable_settings(&self.config))
                .await
                .map_err(|e| BootError::PhaseFailed {
                    phase: "meta_loop",
                    reason: e.to_string(),
                })?,
        );
        let meta = Arc::new(MetaLoop::new(
            self.config.meta_loop.clone(),
            Arc::clone(&incidents),
            Arc::clone(&governance),
            Arc::clone(&publisher),
            Arc::clone(&store),
        ));
        if failed_phase.is_none() {
            let phase = BOOT_PHASES[8];
            publish_phase(&publisher, EventType::BootPhaseStarted, phase, None).await;
            meta.start().await;
            publish_phase(&publisher, EventType::BootPhaseOk, phase, None).await;
        }

        // ---- Terminal state --------------------------------------------------
        if let Some(failed) = failed_phase {
            let skipped: Vec<&'static str> = BOOT_PHASES
                .iter()
                .skip_while(|p| p.name != failed)
                .skip(1)
                .map(|p| p.name)
                .collect();
            let mut payload = Map::new();
            payload.insert("failed_phase".to_string(), json!(failed));
            payload.insert("skipped_phases".to_string(), json!(skipped));
            let _ = publisher
                .publish_typed(EventType::BootDegraded, payload, "boot", PublishOpts::default())
                .await;
            error!(failed_phase = failed, "boot degraded");
            state = BootState::Degraded {
                failed_phase: failed,
                skipped_phases: skipped,
            };
        } else {
            if chain_broken.is_some() {
                state = BootState::Degraded {
                    failed_phase: "audit_log",
                    skipped_phases: Vec::new(),
                };
            }
            let mut payload = Map::new();
            payload.insert("port".to_string(), json!(port));
            let _ = publisher
                .publish_typed(EventType::SystemReady, payload, "boot", PublishOpts::default())
                .await;
            info!(port, "system ready");
        }

        Ok(ControlPlane {
            config: self.config,
            clock: self.clock,
            bus,
            audit,
            publisher,
            incidents,
            governance,
            kernels,
            playbooks,
            mesh,
            scheduler,
            orchestrator,
            guardian,
            healer,
            meta,
            store,
            state,
            port,
        })
    }
}

/// Flat tunables exposed to the meta-loop's revision machinery.
fn tunable_settings(config: &GraceConfig) -> Map<String, Value> {
    let mut settings = Map::new();
    settings.insert(
        "guardian.scan_interval_ms".to_string(),
        json!(config.guardian.scan_interval_ms),
    );
    settings.insert("htm.max_workers".to_string(), json!(config.htm.max_workers));
    settings.insert(
        "htm.default_sla_ms".to_string(),
        json!(config.htm.default_sla_ms),
    );
    settings.insert("htm.max_attempts".to_string(), json!(config.htm.max_attempts));
    settings.insert(
        "meta_loop.interval_ms".to_string(),
        json!(config.meta_loop.interval_ms),
    );
    settings.insert(
        "governance.approval_timeout_ms".to_string(),
        json!(config.governance.approval_timeout_ms),
    );
    settings
}

fn phase_event(
    event_type: EventType,
    phase: BootPhase,
    reason: Option<String>,
) -> (EventType, Map<String, Value>) {
    let mut payload = Map::new();
    payload.insert("phase".to_string(), json!(phase.name));
    payload.insert("phase_id".to_string(), json!(phase.id));
    if let Some(reason) = reason {
        payload.insert("reason".to_string(), json!(reason));
    }
    (event_type, payload)
}

async fn publish_phase(
    publisher: &Arc<UnifiedPublisher>,
    event_type: EventType,
    phase: BootPhase,
    reason: Option<String>,
) {
    let (event_type, payload) = phase_event(event_type, phase, reason);
    let _ = publisher
        .publish_typed(event_type, payload, "boot", PublishOpts::default())
        .await;
}

async fn run_phase<F>(phase: BootPhase, work: F) -> Result<(), String>
where
    F: std::future::Future<Output = DomainResult<()>>,
{
    match tokio::time::timeout(phase.timeout, work).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("phase {} timed out", phase.name)),
    }
}
