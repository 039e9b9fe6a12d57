//! Boot sequencing: phase order, exit codes, determinism.

use std::sync::Arc;

use tempfile::TempDir;

use grace::domain::models::config::{GraceConfig, PathsConfig};
use grace::domain::ports::approvals::NullApprovalChannel;
use grace::domain::ports::clock::DeterministicClock;
use grace::domain::ports::probe::{InMemoryProbe, SystemProbe};
use grace::services::boot::{BootError, BootOrchestrator, BootState, BOOT_PHASES};

fn ci_config(dir: &TempDir) -> GraceConfig {
    let mut config = GraceConfig {
        ci_mode: true,
        offline_mode: true,
        paths: PathsConfig {
            log_dir: dir.path().to_path_buf(),
        },
        ..GraceConfig::default()
    };
    config.guardian.scan_interval_ms = 3_600_000;
    config
}

async fn boot(dir: &TempDir, config: GraceConfig) -> Result<grace::ControlPlane, BootError> {
    BootOrchestrator::new(
        config,
        Arc::new(InMemoryProbe::new()) as Arc<dyn SystemProbe>,
        Arc::new(NullApprovalChannel),
        Arc::new(DeterministicClock::for_ci()),
    )
    .boot()
    .await
}

#[tokio::test]
async fn phases_run_in_declared_order() {
    let dir = TempDir::new().unwrap();
    let plane = boot(&dir, ci_config(&dir)).await.unwrap();
    assert_eq!(plane.state, BootState::Ready);
    plane.shutdown().await;

    let records = plane.audit.snapshot().await.unwrap();
    let ok_phases: Vec<String> = records
        .iter()
        .filter(|r| r.event.event_type.as_str() == "boot.phase.ok")
        .filter_map(|r| r.event.payload_str("phase").map(String::from))
        .collect();
    let declared: Vec<String> = BOOT_PHASES.iter().map(|p| p.name.to_string()).collect();
    assert_eq!(ok_phases, declared);

    // system.ready comes after the last phase, exactly once.
    let ready_positions: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.event.event_type.as_str() == "system.ready")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(ready_positions.len(), 1);
    let last_phase_ok = records
        .iter()
        .rposition(|r| r.event.event_type.as_str() == "boot.phase.ok")
        .unwrap();
    assert!(ready_positions[0] > last_phase_ok);
}

#[tokio::test]
async fn two_ci_boots_emit_identical_sequences() {
    async fn sequence(dir: &TempDir) -> Vec<String> {
        let plane = boot(dir, ci_config(dir)).await.unwrap();
        plane.shutdown().await;
        plane
            .audit
            .snapshot()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                format!(
                    "{}:{}",
                    r.event.event_type.as_str(),
                    r.event.payload_str("phase").unwrap_or("")
                )
            })
            .filter(|l| l.starts_with("boot.") || l.starts_with("system."))
            .collect()
    }

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    assert_eq!(sequence(&dir_a).await, sequence(&dir_b).await);
}

#[tokio::test]
async fn exhausted_port_range_is_exit_code_3() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(InMemoryProbe::new());
    for port in 8000..8100 {
        probe.seed_bound_port(port, None).await;
    }
    let err = BootOrchestrator::new(
        ci_config(&dir),
        probe as Arc<dyn SystemProbe>,
        Arc::new(NullApprovalChannel),
        Arc::new(DeterministicClock::for_ci()),
    )
    .boot()
    .await
    .unwrap_err();
    assert!(matches!(err, BootError::GateFailed(_)));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn tampered_chain_is_exit_code_4() {
    let dir = TempDir::new().unwrap();
    let plane = boot(&dir, ci_config(&dir)).await.unwrap();
    plane.shutdown().await;

    let audit_path = ci_config(&dir).paths.audit_log();
    let content = std::fs::read_to_string(&audit_path).unwrap();
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    lines[0] = lines[0].replace("\"this_hash\":\"", "\"this_hash\":\"bad0");
    std::fs::write(&audit_path, lines.join("\n") + "\n").unwrap();

    let err = boot(&dir, ci_config(&dir)).await.unwrap_err();
    assert!(matches!(err, BootError::AuditChainBroken(_)));
    assert_eq!(err.exit_code(), 4);

    // ALLOW_DEGRADED_START continues into a degraded boot instead.
    let mut config = ci_config(&dir);
    config.allow_degraded_start = true;
    let plane = boot(&dir, config).await.unwrap();
    assert!(matches!(plane.state, BootState::Degraded { .. }));
    plane.shutdown().await;
}

#[tokio::test]
async fn corrupt_task_journal_is_exit_code_5() {
    let dir = TempDir::new().unwrap();
    let config = ci_config(&dir);
    let journal = config.paths.task_journal();
    std::fs::create_dir_all(journal.parent().unwrap()).unwrap();
    std::fs::write(&journal, "this is not json\n").unwrap();

    let err = boot(&dir, config).await.unwrap_err();
    assert!(matches!(err, BootError::HtmInconsistent(_)));
    assert_eq!(err.exit_code(), 5);
}
