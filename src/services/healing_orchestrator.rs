//! Healing orchestrator: detect -> plan -> govern -> execute -> verify -> learn.
//!
//! Consumes `playbook.proposed` events (raised by the trigger mesh from
//! guardian detections, metric breaches, and operator triggers), opens an
//! incident, asks governance, schedules the playbook as an HTM task, and
//! closes the incident with MTTR on verified success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{WorkerError, WorkerErrorKind, WorkerResult};
use crate::domain::models::event::{Event, EventSeverity, EventType};
use crate::domain::models::governance::{ActionContext, ProposedAction};
use crate::domain::models::incident::{FailureMode, Incident, IncidentStatus};
use crate::domain::models::playbook::{Playbook, Verification};
use crate::domain::models::task::{HtmTask, TaskPriority, TaskState};
use crate::domain::ports::kernel::{result_is_ok, IntentContext};
use crate::services::incident_log::IncidentLog;
use crate::services::htm_scheduler::{HtmScheduler, TaskExecutor};
use crate::services::kernel_registry::KernelRegistry;
use crate::services::playbook_registry::{rank_candidates, PlaybookRegistry};
use crate::services::governance::GovernanceGate;
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// Task kind under which playbooks run in the HTM scheduler.
pub const PLAYBOOK_TASK_KIND: &str = "playbook";

/// Executes playbooks step by step through the kernel registry.
///
/// Each step's action and verification are intents; on step failure with
/// rollback enabled, compensations of completed steps run in reverse order.
pub struct PlaybookRunner {
    playbooks: Arc<PlaybookRegistry>,
    kernels: Arc<KernelRegistry>,
}

impl PlaybookRunner {
    pub fn new(playbooks: Arc<PlaybookRegistry>, kernels: Arc<KernelRegistry>) -> Self {
        Self { playbooks, kernels }
    }

    async fn run_verification(
        &self,
        verification: &Verification,
        context: &Map<String, Value>,
        correlation: Option<Uuid>,
    ) -> WorkerResult<bool> {
        let inputs = merge_inputs(context, &verification.inputs);
        let mut ctx = IntentContext::with_inputs(inputs);
        ctx.correlation_id = correlation;
        let result = self
            .kernels
            .dispatch(&verification.action, ctx)
            .await
            .map_err(|e| WorkerError::fatal(WorkerErrorKind::Internal, e.to_string()))??;
        Ok(result_is_ok(&result))
    }

    async fn rollback(
        &self,
        playbook: &Playbook,
        completed: usize,
        context: &Map<String, Value>,
        correlation: Option<Uuid>,
    ) {
        for step in playbook.steps[..completed].iter().rev() {
            let Some(compensation) = &step.compensation else {
                continue;
            };
            let inputs = merge_inputs(context, &compensation.inputs);
            let mut ctx = IntentContext::with_inputs(inputs);
            ctx.correlation_id = correlation;
            match self.kernels.dispatch(&compensation.action, ctx).await {
                Ok(Ok(_)) => info!(step = %step.name, "compensation applied"),
                Ok(Err(e)) => warn!(step = %step.name, error = %e, "compensation failed"),
                Err(e) => warn!(step = %step.name, error = %e, "compensation unroutable"),
            }
        }
    }
}

fn merge_inputs(context: &Map<String, Value>, step_inputs: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = context.clone();
    for (key, value) in step_inputs {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[async_trait]
impl TaskExecutor for PlaybookRunner {
    async fn execute(&self, task: HtmTask, cancel: watch::Receiver<bool>) -> WorkerResult<Value> {
        let payload = task.payload.as_object().cloned().unwrap_or_default();
        let playbook_id = payload
            .get("playbook_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WorkerError::fatal(WorkerErrorKind::PreconditionViolation, "missing playbook_id")
            })?;
        let context = payload
            .get("context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let correlation = task.parent_incident;

        let playbook = self.playbooks.get(playbook_id).await.ok_or_else(|| {
            WorkerError::fatal(
                WorkerErrorKind::PreconditionViolation,
                format!("unknown playbook {playbook_id}"),
            )
        })?;

        for precondition in &playbook.preconditions {
            if !self.run_verification(precondition, &context, correlation).await? {
                return Err(WorkerError::fatal(
                    WorkerErrorKind::PreconditionViolation,
                    format!("precondition '{}' does not hold", precondition.action),
                ));
            }
        }

        let mut steps_run: Vec<String> = Vec::new();
        for (idx, step) in playbook.steps.iter().enumerate() {
            if *cancel.borrow() {
                return Err(WorkerError::cancelled());
            }

            let inputs = merge_inputs(&context, &step.inputs);
            let mut ctx = IntentContext::with_inputs(inputs);
            ctx.correlation_id = correlation;

            let step_result = self
                .kernels
                .dispatch(&step.action, ctx)
                .await
                .map_err(|e| WorkerError::fatal(WorkerErrorKind::Internal, e.to_string()))?;

            let failure = match step_result {
                Err(err) => Some(err),
                Ok(_) => {
                    // Per-step verification is mandatory; a missing rule is
                    // unreachable past registration.
                    let verified = match &step.verification {
                        Some(v) => self.run_verification(v, &context, correlation).await?,
                        None => false,
                    };
                    if verified {
                        None
                    } else {
                        Some(WorkerError::transient(
                            WorkerErrorKind::Unavailable,
                            format!("step '{}' verification failed", step.name),
                        ))
                    }
                }
            };

            if let Some(mut err) = failure {
                if playbook.rollback {
                    self.rollback(&playbook, idx, &context, correlation).await;
                }
                if !step.retry {
                    err.retryable = false;
                }
                err.message = format!("step '{}': {}", step.name, err.message);
                return Err(err);
            }
            steps_run.push(step.name.clone());
        }

        for verification in &playbook.verifications {
            if !self.run_verification(verification, &context, correlation).await? {
                return Err(WorkerError::transient(
                    WorkerErrorKind::Unavailable,
                    format!("playbook verification '{}' failed", verification.action),
                ));
            }
        }

        Ok(json!({ "ok": true, "playbook_id": playbook.id, "steps_run": steps_run }))
    }
}

/// A proposal that passed admission: parsed, deduplicated, and already
/// holding an open incident.
pub struct AdmittedProposal {
    pub proposal: Event,
    pub trigger_payload: Map<String, Value>,
    pub incident: Incident,
    pub correlation: Uuid,
    pub severity: EventSeverity,
}

/// Configuration for the healing orchestrator.
#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// SLA per playbook task attempt, in ms.
    pub task_sla_ms: u64,
    /// Attempt cap per playbook task.
    pub max_attempts: u32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            task_sla_ms: 30_000,
            max_attempts: 3,
        }
    }
}

/// The healing orchestrator service.
pub struct HealingOrchestrator {
    config: HealingConfig,
    incidents: Arc<IncidentLog>,
    playbooks: Arc<PlaybookRegistry>,
    governance: Arc<GovernanceGate>,
    scheduler: Arc<HtmScheduler>,
    publisher: Arc<UnifiedPublisher>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealingOrchestrator {
    pub fn new(
        config: HealingConfig,
        incidents: Arc<IncidentLog>,
        playbooks: Arc<PlaybookRegistry>,
        governance: Arc<GovernanceGate>,
        scheduler: Arc<HtmScheduler>,
        publisher: Arc<UnifiedPublisher>,
    ) -> Self {
        Self {
            config,
            incidents,
            playbooks,
            governance,
            scheduler,
            publisher,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start consuming `playbook.proposed` events.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self
            .publisher
            .bus()
            .subscribe("healing_orchestrator", vec!["playbook.proposed".to_string()])
            .await;

        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("healing orchestrator started");
            while orchestrator.running.load(Ordering::SeqCst) {
                let Some(event) = stream.recv().await else {
                    break;
                };
                // Admission (dedup + incident creation) is serial so two
                // proposals for the same issue cannot both open incidents;
                // the execution of admitted flows runs concurrently.
                if let Some(admitted) = orchestrator.admit(event).await {
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        orchestrator.execute_admitted(admitted).await;
                    });
                }
            }
            info!("healing orchestrator stopped");
        });
        *self.handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Drive one proposal through the full healing flow (admission plus
    /// execution, in one call). Used directly by tests; the bus-driven
    /// loop splits the two so admission stays serial.
    pub async fn handle_proposal(&self, proposal: Event) {
        if let Some(admitted) = self.admit(proposal).await {
            self.execute_admitted(admitted).await;
        }
    }

    /// Admission: parse, dedup against open incidents, open the incident.
    #[instrument(skip(self, proposal), fields(event_id = %proposal.id))]
    pub async fn admit(&self, proposal: Event) -> Option<AdmittedProposal> {
        let trigger_payload = proposal
            .payload
            .get("trigger_payload")
            .and_then(Value::as_object)
            .cloned()
            .or_else(|| {
                warn!("proposal without trigger payload; dropping");
                None
            })?;
        let Some(failure_mode) = trigger_payload
            .get("category")
            .and_then(Value::as_str)
            .and_then(FailureMode::from_str)
        else {
            debug!("proposal without a known failure category; dropping");
            return None;
        };
        let severity = proposal
            .payload_str("trigger_severity")
            .and_then(|s| match s {
                "debug" => Some(EventSeverity::Debug),
                "info" => Some(EventSeverity::Info),
                "warn" => Some(EventSeverity::Warn),
                "error" => Some(EventSeverity::Error),
                "critical" => Some(EventSeverity::Critical),
                _ => None,
            })
            .unwrap_or(EventSeverity::Warn);
        let subject = trigger_payload
            .get("subject")
            .and_then(Value::as_str)
            .map(String::from);

        // One open incident per (mode, subject): repeated detections while
        // healing is underway fold into the existing incident.
        match self.open_incident_exists(failure_mode, subject.as_deref()) {
            Ok(true) => {
                debug!(mode = %failure_mode, "open incident already underway; skipping proposal");
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "could not read incident log; proceeding");
            }
        }

        let correlation = proposal.correlation_id.unwrap_or_else(Uuid::new_v4);
        let mut incident = Incident::new(
            failure_mode,
            severity,
            self.publisher.clock().now_utc(),
        );
        if let Some(subject) = subject {
            incident = incident.with_detail(subject);
        }
        if let Err(e) = self.incidents.append(&incident) {
            warn!(error = %e, "could not open incident");
            return None;
        }
        self.publish_incident_event(
            EventType::HealingIncidentDetected,
            &incident,
            correlation,
            None,
        )
        .await;

        Some(AdmittedProposal {
            proposal,
            trigger_payload,
            incident,
            correlation,
            severity,
        })
    }

    /// Execution: playbook selection, governance, HTM task, outcome.
    pub async fn execute_admitted(&self, admitted: AdmittedProposal) {
        if let Err(e) = self.run_healing_flow(admitted).await {
            warn!(error = %e, "healing flow aborted");
        }
    }

    fn open_incident_exists(
        &self,
        mode: FailureMode,
        subject: Option<&str>,
    ) -> crate::domain::errors::DomainResult<bool> {
        let folded = self.incidents.fold()?;
        Ok(folded.values().any(|i| {
            !i.status.is_terminal()
                && i.failure_mode == mode
                && i.detail.as_deref() == subject
        }))
    }

    async fn run_healing_flow(
        &self,
        admitted: AdmittedProposal,
    ) -> crate::domain::errors::DomainResult<()> {
        let AdmittedProposal {
            proposal,
            trigger_payload,
            mut incident,
            correlation,
            severity,
        } = admitted;
        let clock = self.publisher.clock();
        let failure_mode = incident.failure_mode;

        // Select the playbook: candidates for the mode, ranked by
        // historical success rate, lowest risk breaking ties.
        let rates = self.incidents.playbook_success_rates(None)?;
        let candidates = self.playbooks.for_failure_mode(failure_mode).await;
        let proposed_id = proposal.payload_str("playbook_id").map(String::from);
        let mut selected = rank_candidates(candidates, &rates).into_iter().next();
        if selected.is_none() {
            // Fall back to the literal proposal if the mode has no entry.
            if let Some(id) = proposed_id.as_deref() {
                selected = self.playbooks.get(id).await;
            }
        }
        let Some(playbook) = selected else {
            warn!(mode = %failure_mode, "no playbook available; escalating incident");
            incident.transition(IncidentStatus::Escalated).ok();
            self.incidents.append(&incident)?;
            return Ok(());
        };

        incident = incident.with_playbook(playbook.id.clone());
        incident.transition(IncidentStatus::InProgress).ok();
        self.incidents.append(&incident)?;

        // Governance.
        let action = ProposedAction::new(
            playbook.action_type.clone(),
            "healing_orchestrator",
            format!("incident:{}", incident.incident_id),
        )
        .with_context(ActionContext::default().with_risk(playbook.risk_level));
        let decision = self.governance.authorize(&action).await?;
        if decision.decision.is_deny() {
            info!(
                incident_id = %incident.incident_id,
                reason = %decision.reason,
                "governance denied healing; escalating"
            );
            incident.transition(IncidentStatus::Escalated).ok();
            self.incidents.append(&incident)?;
            return Ok(());
        }

        // Schedule the playbook as an HTM task.
        let priority = if severity >= EventSeverity::Error {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        };
        let task = HtmTask::new(
            PLAYBOOK_TASK_KIND,
            json!({ "playbook_id": playbook.id, "context": trigger_payload }),
            "self-healing",
        )
        .with_priority(priority)
        .with_sla_ms(self.config.task_sla_ms)
        .with_max_attempts(self.config.max_attempts)
        .with_parent_incident(incident.incident_id);
        let task_id = self.scheduler.submit(task).await?;

        // Await the verified outcome.
        let per_attempt = self.config.task_sla_ms + 35_000;
        let deadline = Duration::from_millis(per_attempt * u64::from(self.config.max_attempts));
        let state = self.scheduler.wait_terminal(task_id, deadline).await?;

        let ended_at = clock.now_utc();
        for step in &playbook.steps {
            incident.record_action(step.action.clone(), ended_at, state == TaskState::Succeeded);
        }

        match state {
            TaskState::Succeeded => {
                incident
                    .resolve(ended_at)
                    .map_err(crate::domain::errors::DomainError::ValidationFailed)?;
                self.incidents.append(&incident)?;
                info!(
                    incident_id = %incident.incident_id,
                    mttr_seconds = incident.mttr_seconds,
                    "incident resolved"
                );
                self.publish_incident_event(
                    EventType::HealingIncidentResolved,
                    &incident,
                    correlation,
                    None,
                )
                .await;
            }
            TaskState::Cancelled => {
                incident.transition(IncidentStatus::Failed).ok();
                self.incidents.append(&incident)?;
                self.publish_incident_event(
                    EventType::HealingFailed,
                    &incident,
                    correlation,
                    Some("cancelled"),
                )
                .await;
            }
            state => {
                incident.transition(IncidentStatus::Failed).ok();
                self.incidents.append(&incident)?;
                let reason = self
                    .scheduler
                    .get(task_id)
                    .await
                    .and_then(|t| t.last_error.map(|e| e.message))
                    .unwrap_or_else(|| state.as_str().to_string());
                self.publish_incident_event(
                    EventType::HealingFailed,
                    &incident,
                    correlation,
                    Some(&reason),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn publish_incident_event(
        &self,
        event_type: EventType,
        incident: &Incident,
        correlation: Uuid,
        reason: Option<&str>,
    ) {
        let mut payload = Map::new();
        payload.insert(
            "incident_id".to_string(),
            json!(incident.incident_id.to_string()),
        );
        payload.insert(
            "failure_mode".to_string(),
            json!(incident.failure_mode.as_str()),
        );
        payload.insert("status".to_string(), json!(incident.status.as_str()));
        if let Some(mttr) = incident.mttr_seconds {
            payload.insert("mttr_seconds".to_string(), json!(mttr));
        }
        if let Some(playbook_id) = &incident.playbook_id {
            payload.insert("playbook_id".to_string(), json!(playbook_id));
        }
        if let Some(reason) = reason {
            payload.insert("reason".to_string(), json!(reason));
        }
        if let Err(e) = self
            .publisher
            .publish_typed(
                event_type,
                payload,
                "healing_orchestrator",
                PublishOpts::correlated(correlation),
            )
            .await
        {
            warn!(error = %e, "failed to publish incident event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::playbook::PlaybookStep;
    use crate::domain::ports::probe::{InMemoryProbe, SystemProbe};
    use crate::services::builtin_kernels::SelfHealingKernel;
    use serde_json::Map as JsonMap;
    use tempfile::TempDir;

    async fn runner_fixture() -> (PlaybookRunner, Arc<InMemoryProbe>, Arc<PlaybookRegistry>) {
        let probe = Arc::new(InMemoryProbe::new());
        let kernels = Arc::new(KernelRegistry::new());
        kernels
            .register(Arc::new(SelfHealingKernel::new(
                Arc::clone(&probe) as Arc<dyn crate::domain::ports::probe::SystemProbe>
            )))
            .await
            .unwrap();
        let playbooks = Arc::new(PlaybookRegistry::with_builtins().await.unwrap());
        (
            PlaybookRunner::new(Arc::clone(&playbooks), kernels),
            probe,
            playbooks,
        )
    }

    fn playbook_task(playbook_id: &str, context: JsonMap<String, Value>) -> HtmTask {
        HtmTask::new(
            PLAYBOOK_TASK_KIND,
            json!({ "playbook_id": playbook_id, "context": context }),
            "self-healing",
        )
    }

    #[tokio::test]
    async fn test_runner_heals_zombie() {
        let (runner, probe, _playbooks) = runner_fixture().await;
        probe.seed_bound_port(8002, Some(4242)).await;
        probe.seed_zombie(4242).await;

        let mut context = JsonMap::new();
        context.insert("pid".to_string(), json!(4242));
        context.insert("category".to_string(), json!("zombie_process"));

        let (_tx, rx) = watch::channel(false);
        let result = runner
            .execute(playbook_task("zombie_process.kill_and_release", context), rx)
            .await
            .unwrap();

        assert_eq!(result["ok"], json!(true));
        assert!(probe.port_is_free(8002).await);
    }

    #[tokio::test]
    async fn test_runner_fails_when_verification_fails() {
        let (runner, probe, playbooks) = runner_fixture().await;
        // A playbook whose step runs but whose verification can never pass:
        // the port stays bound by someone else.
        probe.seed_zombie(1).await;
        probe.seed_bound_port(9999, None).await;
        playbooks
            .register(
                Playbook::new("test.noop_verify_port", "step ok, verify fails")
                    .remediates(FailureMode::ZombieProcess)
                    .with_step(
                        PlaybookStep::new("kill", "probe.kill_process")
                            .verified_by(Verification::action("verify.port_free")),
                    )
                    .with_verification(Verification::action("verify.port_free")),
            )
            .await
            .unwrap();

        let mut context = JsonMap::new();
        context.insert("pid".to_string(), json!(1));
        context.insert("port".to_string(), json!(9999));

        let (_tx, rx) = watch::channel(false);
        let err = runner
            .execute(playbook_task("test.noop_verify_port", context), rx)
            .await
            .unwrap_err();
        assert!(err.message.contains("verification failed"));
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_runner_rolls_back_on_failure() {
        let (runner, probe, playbooks) = runner_fixture().await;
        probe.seed_zombie(10).await;
        probe.seed_dns_broken().await;

        // Step 1 succeeds (kill zombie, compensated by flush_dns so the
        // rollback is observable); step 2 fails (kill a pid that is not
        // defunct), triggering rollback.
        playbooks
            .register(
                Playbook::new("test.rollback", "rollback exercise")
                    .remediates(FailureMode::ZombieProcess)
                    .with_step(
                        PlaybookStep::new("kill_first", "probe.kill_process")
                            .with_input("pid", json!(10))
                            .verified_by(Verification::action("verify.scan_clear"))
                            .compensated_by(Verification::action("probe.flush_dns")),
                    )
                    .with_step(
                        PlaybookStep::new("kill_missing", "probe.kill_process")
                            .with_input("pid", json!(777))
                            .verified_by(Verification::action("verify.scan_clear"))
                            .no_retry(),
                    )
                    .with_verification(Verification::action("verify.scan_clear"))
                    .with_rollback(),
            )
            .await
            .unwrap();

        let mut context = JsonMap::new();
        context.insert("category".to_string(), json!("zombie_process"));

        let (_tx, rx) = watch::channel(false);
        let err = runner
            .execute(playbook_task("test.rollback", context), rx)
            .await
            .unwrap_err();

        // no_retry made the failure fatal, and the compensation ran.
        assert!(!err.retryable);
        assert!(probe.scan(FailureMode::DnsFailure).await.is_empty());
    }

    #[tokio::test]
    async fn test_runner_rejects_unknown_playbook() {
        let (runner, _probe, _playbooks) = runner_fixture().await;
        let (_tx, rx) = watch::channel(false);
        let err = runner
            .execute(playbook_task("missing.playbook", JsonMap::new()), rx)
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.kind, WorkerErrorKind::PreconditionViolation);
    }

    // Full pipeline tests (proposal -> incident -> governance -> task ->
    // resolution) live in tests/healing_integration_test.rs.
    #[tokio::test]
    async fn test_open_incident_dedup() {
        let dir = TempDir::new().unwrap();
        let incidents = Arc::new(
            IncidentLog::open(dir.path().join("incidents.jsonl"))
                .await
                .unwrap(),
        );
        let mut incident = Incident::new(
            FailureMode::ZombieProcess,
            EventSeverity::Warn,
            chrono::Utc::now(),
        )
        .with_detail("pid:42");
        incidents.append(&incident).unwrap();

        let folded = incidents.fold().unwrap();
        assert_eq!(folded.len(), 1);

        // After resolution the same subject may open a fresh incident.
        incident.transition(IncidentStatus::InProgress).unwrap();
        incident.resolve(chrono::Utc::now()).unwrap();
        incidents.append(&incident).unwrap();
        let folded = incidents.fold().unwrap();
        assert!(folded.values().all(|i| i.status.is_terminal()));
    }
}
