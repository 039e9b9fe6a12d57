//! Guardian: boot gating and the watchdog scan surface.
//!
//! Boot-gate mode runs synchronously before the kernel phase and must
//! produce a port allocation (`GRACE_PORT` when set, else an upward scan).
//! Watchdog scans cover the eight failure categories through the
//! `SystemProbe` seam; every finding is published as
//! `guardian.issue.detected{category}`. The healer owns the periodic loop.

use std::sync::Arc;

use serde_json::{json, Map};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::GuardianConfig;
use crate::domain::models::event::EventType;
use crate::domain::models::incident::FailureMode;
use crate::domain::ports::probe::{Detection, SystemProbe};
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// The guardian service.
pub struct Guardian {
    config: GuardianConfig,
    probe: Arc<dyn SystemProbe>,
    publisher: Arc<UnifiedPublisher>,
    /// Local-only probing: skip categories that require outbound calls.
    offline: bool,
    allocated_port: RwLock<Option<u16>>,
}

impl Guardian {
    pub fn new(
        config: GuardianConfig,
        probe: Arc<dyn SystemProbe>,
        publisher: Arc<UnifiedPublisher>,
        offline: bool,
    ) -> Self {
        Self {
            config,
            probe,
            publisher,
            offline,
            allocated_port: RwLock::new(None),
        }
    }

    /// Boot gate: prove a listening port before anything else starts.
    ///
    /// Honors the preferred port when set; otherwise scans upward from the
    /// configured start. Failure here is fatal to boot (exit code 3).
    #[instrument(skip(self))]
    pub async fn boot_gate(&self, preferred: Option<u16>) -> DomainResult<u16> {
        let port = match preferred {
            Some(port) => {
                if self.probe.port_is_free(port).await {
                    port
                } else {
                    return Err(DomainError::BootPhaseFailed {
                        phase: "guardian",
                        reason: format!("configured port {port} is already bound"),
                    });
                }
            }
            None => self
                .probe
                .find_free_port(self.config.port_scan_start, self.config.port_scan_end)
                .await
                .ok_or(DomainError::BootPhaseFailed {
                    phase: "guardian",
                    reason: format!(
                        "no free port in {}..{}",
                        self.config.port_scan_start, self.config.port_scan_end
                    ),
                })?,
        };

        *self.allocated_port.write().await = Some(port);
        let mut payload = Map::new();
        payload.insert("port".to_string(), json!(port));
        payload.insert("preferred".to_string(), json!(preferred));
        self.publisher
            .publish_typed(
                EventType::GuardianPortAllocated,
                payload,
                "guardian",
                PublishOpts::default(),
            )
            .await?;
        info!(port, "boot gate passed; port allocated");
        Ok(port)
    }

    /// The port proven at boot, once the gate has run.
    pub async fn allocated_port(&self) -> Option<u16> {
        *self.allocated_port.read().await
    }

    /// The categories scanned in the current mode. Offline runs drop the
    /// DNS probe (the only outbound one); everything else is local.
    pub fn scan_categories(&self) -> Vec<FailureMode> {
        FailureMode::ALL
            .into_iter()
            .filter(|mode| !(self.offline && *mode == FailureMode::DnsFailure))
            .collect()
    }

    /// One full watchdog sweep: publish every finding, then a completion
    /// event carrying the issue count.
    #[instrument(skip(self))]
    pub async fn scan_once(&self) -> DomainResult<Vec<Detection>> {
        self.publisher
            .publish_typed(
                EventType::GuardianScanStarted,
                Map::new(),
                "guardian",
                PublishOpts::default(),
            )
            .await?;

        let detections = self.probe.scan_all(&self.scan_categories()).await;
        for detection in &detections {
            let mut payload = Map::new();
            payload.insert("category".to_string(), json!(detection.failure_mode.as_str()));
            payload.insert("detail".to_string(), json!(detection.detail));
            if let Some(subject) = &detection.subject {
                payload.insert("subject".to_string(), json!(subject));
                // Lift well-known subject parts for payload predicates.
                for part in subject.split(',') {
                    if let Some(pid) = part.strip_prefix("pid:") {
                        if let Ok(pid) = pid.parse::<i64>() {
                            payload.insert("pid".to_string(), json!(pid));
                        }
                    }
                    if let Some(port) = part.strip_prefix("port:") {
                        if let Ok(port) = port.parse::<u64>() {
                            payload.insert("port".to_string(), json!(port));
                        }
                    }
                    if let Some(iface) = part.strip_prefix("iface:") {
                        payload.insert("iface".to_string(), json!(iface));
                    }
                }
            }
            warn!(
                category = detection.failure_mode.as_str(),
                detail = %detection.detail,
                "guardian issue detected"
            );
            self.publisher
                .publish_typed(
                    EventType::GuardianIssueDetected,
                    payload,
                    "guardian",
                    PublishOpts::default().with_severity(detection.severity),
                )
                .await?;
        }

        let mut payload = Map::new();
        payload.insert("issues".to_string(), json!(detections.len()));
        self.publisher
            .publish_typed(
                EventType::GuardianScanCompleted,
                payload,
                "guardian",
                PublishOpts::default(),
            )
            .await?;
        Ok(detections)
    }

    /// Re-scan a single category (the healer's confirmation pass).
    pub async fn confirm_clear(&self, mode: FailureMode) -> bool {
        self.probe.scan(mode).await.is_empty()
    }

    pub fn probe(&self) -> &Arc<dyn SystemProbe> {
        &self.probe
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::EventSeverity;
    use crate::domain::ports::clock::{Clock, SystemClock};
    use crate::domain::ports::probe::InMemoryProbe;
    use crate::services::audit_log::AuditLog;
    use crate::services::event_bus::EventBus;
    use tempfile::TempDir;

    async fn guardian_fixture(
        offline: bool,
    ) -> (Guardian, Arc<InMemoryProbe>, Arc<EventBus>, TempDir) {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let publisher = Arc::new(UnifiedPublisher::new(Arc::clone(&bus), audit, clock));
        let probe = Arc::new(InMemoryProbe::new());
        let guardian = Guardian::new(
            GuardianConfig::default(),
            Arc::clone(&probe) as Arc<dyn SystemProbe>,
            publisher,
            offline,
        );
        (guardian, probe, bus, dir)
    }

    #[tokio::test]
    async fn test_boot_gate_prefers_configured_port() {
        let (guardian, _probe, _bus, _dir) = guardian_fixture(false).await;
        let port = guardian.boot_gate(Some(8443)).await.unwrap();
        assert_eq!(port, 8443);
        assert_eq!(guardian.allocated_port().await, Some(8443));
    }

    #[tokio::test]
    async fn test_boot_gate_fails_on_bound_preferred_port() {
        let (guardian, probe, _bus, _dir) = guardian_fixture(false).await;
        probe.seed_bound_port(8443, None).await;
        let err = guardian.boot_gate(Some(8443)).await.unwrap_err();
        assert!(matches!(err, DomainError::BootPhaseFailed { .. }));
        assert_eq!(guardian.allocated_port().await, None);
    }

    #[tokio::test]
    async fn test_boot_gate_scans_upward() {
        let (guardian, probe, _bus, _dir) = guardian_fixture(false).await;
        probe.seed_bound_port(8000, None).await;
        probe.seed_bound_port(8001, None).await;
        let port = guardian.boot_gate(None).await.unwrap();
        assert_eq!(port, 8002);
    }

    #[tokio::test]
    async fn test_scan_publishes_detections() {
        let (guardian, probe, bus, _dir) = guardian_fixture(false).await;
        let stream = bus.subscribe("t", vec!["guardian".to_string()]).await;
        probe.seed_bound_port(8002, Some(4242)).await;
        probe.seed_zombie(4242).await;

        let detections = guardian.scan_once().await.unwrap();
        assert_eq!(detections.len(), 1);

        let started = stream.recv().await.unwrap();
        assert_eq!(started.event_type, EventType::GuardianScanStarted);

        let detected = stream.recv().await.unwrap();
        assert_eq!(detected.event_type, EventType::GuardianIssueDetected);
        assert_eq!(detected.payload_str("category"), Some("zombie_process"));
        assert_eq!(detected.payload_u64("pid"), Some(4242));
        assert_eq!(detected.payload_u64("port"), Some(8002));
        assert_eq!(detected.severity, EventSeverity::Error);

        let completed = stream.recv().await.unwrap();
        assert_eq!(completed.event_type, EventType::GuardianScanCompleted);
        assert_eq!(completed.payload_u64("issues"), Some(1));
    }

    #[tokio::test]
    async fn test_offline_mode_skips_dns() {
        let (guardian, probe, _bus, _dir) = guardian_fixture(true).await;
        probe.seed_dns_broken().await;

        assert!(!guardian.scan_categories().contains(&FailureMode::DnsFailure));
        let detections = guardian.scan_once().await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_clear_after_remediation() {
        let (guardian, probe, _bus, _dir) = guardian_fixture(false).await;
        probe.seed_zombie(99).await;
        assert!(!guardian.confirm_clear(FailureMode::ZombieProcess).await);

        let mut inputs = Map::new();
        inputs.insert("pid".to_string(), json!(99));
        probe.remediate("probe.kill_process", &inputs).await.unwrap();
        assert!(guardian.confirm_clear(FailureMode::ZombieProcess).await);
    }
}
