//! End-to-end healing pipeline tests.
//!
//! Boots the full control plane against the in-memory probe and drives
//! real detections through guardian -> mesh -> governance -> HTM -> the
//! incident log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

use grace::domain::errors::WorkerResult;
use grace::domain::models::config::{GraceConfig, PathsConfig};
use grace::domain::models::incident::{FailureMode, IncidentStatus};
use grace::domain::models::task::HtmTask;
use grace::domain::ports::approvals::NullApprovalChannel;
use grace::domain::ports::clock::SystemClock;
use grace::domain::ports::probe::{InMemoryProbe, SystemProbe};
use grace::services::audit_log::AuditFilter;
use grace::services::boot::{BootOrchestrator, BootState, ControlPlane};
use grace::services::healing_orchestrator::PLAYBOOK_TASK_KIND;
use grace::services::htm_scheduler::TaskExecutor;

fn fast_config(dir: &TempDir) -> GraceConfig {
    let mut config = GraceConfig {
        offline_mode: true,
        paths: PathsConfig {
            log_dir: dir.path().to_path_buf(),
        },
        ..GraceConfig::default()
    };
    config.guardian.scan_interval_ms = 50;
    config.htm.default_sla_ms = 5_000;
    config
}

async fn boot_plane(dir: &TempDir) -> (ControlPlane, Arc<InMemoryProbe>) {
    let probe = Arc::new(InMemoryProbe::new());
    let plane = BootOrchestrator::new(
        fast_config(dir),
        Arc::clone(&probe) as Arc<dyn SystemProbe>,
        Arc::new(NullApprovalChannel),
        Arc::new(SystemClock::new()),
    )
    .boot()
    .await
    .expect("boot succeeds");
    assert_eq!(plane.state, BootState::Ready);
    (plane, probe)
}

async fn wait_for<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn zombie_process_healed_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (plane, probe) = boot_plane(&dir).await;

    // A defunct pid holding port 8002 appears after boot.
    probe.seed_bound_port(8002, Some(4242)).await;
    probe.seed_zombie(4242).await;

    // The watchdog detects it; the pipeline heals it.
    let incidents = Arc::clone(&plane.incidents);
    let resolved = wait_for(Duration::from_secs(10), || {
        incidents.fold().is_ok_and(|folded| {
            folded.values().any(|i| {
                i.failure_mode == FailureMode::ZombieProcess
                    && i.status == IncidentStatus::Resolved
            })
        })
    })
    .await;
    assert!(resolved, "incident never resolved");

    let folded = plane.incidents.fold().unwrap();
    let incident = folded
        .values()
        .find(|i| i.failure_mode == FailureMode::ZombieProcess)
        .unwrap();
    assert_eq!(
        incident.playbook_id.as_deref(),
        Some("zombie_process.kill_and_release")
    );
    let mttr = incident.mttr_seconds.expect("mttr fixed on resolution");
    assert!(mttr >= 0.0);
    assert!(mttr < 2.0, "mttr {mttr}s exceeds the 2s budget");
    assert!(!incident.actions_taken.is_empty());

    // The world is actually clean and the next scan agrees.
    assert!(probe.port_is_free(8002).await);
    assert!(probe.scan(FailureMode::ZombieProcess).await.is_empty());
    let detections = plane.guardian.scan_once().await.unwrap();
    assert!(detections.is_empty());

    // Governance preceded execution in the audit record.
    let records = plane.audit.snapshot().await.unwrap();
    let decision_idx = records
        .iter()
        .position(|r| {
            r.event.event_type.as_str() == "governance.decision"
                && r.event.payload_str("decision") == Some("auto_approve")
        })
        .expect("governance decision audited");
    let dispatch_idx = records
        .iter()
        .position(|r| r.event.event_type.as_str() == "htm.task.dispatched")
        .expect("task dispatch audited");
    assert!(decision_idx < dispatch_idx, "decision must precede dispatch");

    plane.shutdown().await;
}

#[tokio::test]
async fn repeated_detections_fold_into_one_open_incident() {
    let dir = TempDir::new().unwrap();
    let (plane, probe) = boot_plane(&dir).await;

    probe.seed_dns_broken().await;
    // Offline mode skips the DNS category in watchdog scans, so feed the
    // detections through the mesh directly.
    let mut payload = Map::new();
    payload.insert("category".to_string(), json!("dns_failure"));
    for _ in 0..3 {
        plane
            .publisher
            .publish(
                "guardian.issue.detected",
                payload.clone(),
                "guardian",
                grace::services::publisher::PublishOpts::default(),
            )
            .await
            .unwrap();
    }

    let incidents = Arc::clone(&plane.incidents);
    assert!(
        wait_for(Duration::from_secs(10), || {
            incidents.fold().is_ok_and(|folded| {
                folded
                    .values()
                    .any(|i| i.failure_mode == FailureMode::DnsFailure && i.status.is_terminal())
            })
        })
        .await
    );

    // Give any duplicate proposals time to land, then count incidents.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let folded = plane.incidents.fold().unwrap();
    let dns_incidents = folded
        .values()
        .filter(|i| i.failure_mode == FailureMode::DnsFailure)
        .count();
    assert_eq!(dns_incidents, 1, "duplicate detections opened extra incidents");

    plane.shutdown().await;
}

struct StallExecutor;

#[async_trait]
impl TaskExecutor for StallExecutor {
    async fn execute(&self, _task: HtmTask, mut cancel: watch::Receiver<bool>) -> WorkerResult<Value> {
        // Honors cancellation, but otherwise runs to the SLA.
        let _ = cancel.changed().await;
        Err(grace::domain::errors::WorkerError::cancelled())
    }
}

#[tokio::test]
async fn cancelled_playbook_marks_incident_failed() {
    let dir = TempDir::new().unwrap();
    let (plane, _probe) = boot_plane(&dir).await;

    // Replace the playbook runner with a stalling executor so the task is
    // cancellable mid-flight.
    plane
        .scheduler
        .register_executor(PLAYBOOK_TASK_KIND, Arc::new(StallExecutor))
        .await;

    let mut payload = Map::new();
    payload.insert("category".to_string(), json!("close_wait_leak"));
    plane
        .publisher
        .publish(
            "guardian.issue.detected",
            payload,
            "guardian",
            grace::services::publisher::PublishOpts::default(),
        )
        .await
        .unwrap();

    // Wait for the playbook task to be created, then cancel it via the bus.
    let mut created = Vec::new();
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        created = plane
            .audit
            .query(AuditFilter::new().with_type_prefix("htm.task.created"))
            .await
            .unwrap();
        if !created.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!created.is_empty(), "playbook task never created");
    let task_id = created[0].event.payload_str("task_id").unwrap().to_string();
    assert!(Uuid::parse_str(&task_id).is_ok());

    let mut cancel_payload = Map::new();
    cancel_payload.insert("task_id".to_string(), json!(task_id));
    plane
        .publisher
        .publish(
            "task.cancel",
            cancel_payload,
            "operator",
            grace::services::publisher::PublishOpts::default(),
        )
        .await
        .unwrap();

    let incidents = Arc::clone(&plane.incidents);
    assert!(
        wait_for(Duration::from_secs(10), || {
            incidents.fold().is_ok_and(|folded| {
                folded
                    .values()
                    .any(|i| i.failure_mode == FailureMode::CloseWaitLeak
                        && i.status == IncidentStatus::Failed)
            })
        })
        .await,
        "cancelled task did not fail its incident"
    );

    // The failure reason is recorded as a cancellation.
    let failed = plane
        .audit
        .query(AuditFilter::new().with_type_prefix("healing.failed"))
        .await
        .unwrap();
    assert!(!failed.is_empty());
    assert!(failed[0]
        .event
        .payload_str("reason")
        .is_some_and(|r| r.contains("cancel")));

    plane.shutdown().await;
}
