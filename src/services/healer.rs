//! Healer: the continuous scan-and-heal loop.
//!
//! Drives the guardian's watchdog on its cadence and, after each incident
//! resolution, re-scans the affected category to confirm the fix actually
//! took. A confirmation failure re-publishes the detection, restarting the
//! healing cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::models::event::EventType;
use crate::domain::models::incident::FailureMode;
use crate::services::guardian::Guardian;
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// The healer service.
pub struct Healer {
    guardian: Arc<Guardian>,
    publisher: Arc<UnifiedPublisher>,
    interval: Duration,
    running: Arc<AtomicBool>,
    scans: Arc<AtomicU64>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Healer {
    pub fn new(
        guardian: Arc<Guardian>,
        publisher: Arc<UnifiedPublisher>,
        interval_ms: u64,
    ) -> Self {
        Self {
            guardian,
            publisher,
            interval: Duration::from_millis(interval_ms.max(10)),
            running: Arc::new(AtomicBool::new(false)),
            scans: Arc::new(AtomicU64::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the watchdog cadence and the confirmation listener.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let healer = Arc::clone(self);
        let watchdog = tokio::spawn(async move {
            info!(interval_ms = healer.interval.as_millis() as u64, "healer watchdog started");
            while healer.running.load(Ordering::SeqCst) {
                if let Err(e) = healer.guardian.scan_once().await {
                    warn!(error = %e, "watchdog scan failed");
                }
                healer.scans.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(healer.interval).await;
            }
        });

        let healer = Arc::clone(self);
        let stream = self
            .publisher
            .bus()
            .subscribe("healer_confirm", vec!["healing.incident.resolved".to_string()])
            .await;
        let confirmer = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let Some(mode) = event
                    .payload_str("failure_mode")
                    .and_then(FailureMode::from_str)
                else {
                    continue;
                };
                healer.confirm(mode).await;
            }
        });

        let mut handles = self.handles.lock().await;
        handles.push(watchdog);
        handles.push(confirmer);
    }

    /// Post-resolution confirmation: re-scan one category and either report
    /// the all-clear or re-raise the detection.
    pub async fn confirm(&self, mode: FailureMode) {
        if self.guardian.confirm_clear(mode).await {
            let mut payload = Map::new();
            payload.insert("issues".to_string(), json!(0));
            payload.insert("confirmed_category".to_string(), json!(mode.as_str()));
            if let Err(e) = self
                .publisher
                .publish_typed(
                    EventType::GuardianScanCompleted,
                    payload,
                    "healer",
                    PublishOpts::default(),
                )
                .await
            {
                warn!(error = %e, "failed to publish confirmation");
            }
            info!(category = mode.as_str(), "remediation confirmed clear");
            return;
        }

        warn!(category = mode.as_str(), "remediation did not stick; re-raising");
        let remaining = self.guardian.probe().scan(mode).await;
        for detection in remaining {
            let mut payload = Map::new();
            payload.insert("category".to_string(), json!(detection.failure_mode.as_str()));
            payload.insert("detail".to_string(), json!(detection.detail));
            if let Some(subject) = &detection.subject {
                payload.insert("subject".to_string(), json!(subject));
            }
            if let Err(e) = self
                .publisher
                .publish_typed(
                    EventType::GuardianIssueDetected,
                    payload,
                    "healer",
                    PublishOpts::default().with_severity(detection.severity),
                )
                .await
            {
                warn!(error = %e, "failed to re-raise detection");
            }
        }
    }

    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
    }
}
