//! Meta-loop: outcome-driven, governed configuration tuning.
//!
//! Periodically aggregates audit and incident history into per-playbook and
//! per-component statistics, proposes `ConfigRevision`s when a trend
//! crosses a threshold (e.g. MTTR growth), routes every proposal through
//! the governance gate, and applies approved revisions atomically through
//! a versioned snapshot. Reverts are themselves governed revisions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::MetaLoopConfig;
use crate::domain::models::event::EventType;
use crate::domain::models::governance::ProposedAction;
use crate::domain::models::revision::ConfigRevision;
use crate::services::governance::GovernanceGate;
use crate::services::incident_log::IncidentLog;
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// Governance action type for meta-loop revisions; whitelisted as a T1
/// toggle at boot.
pub const REVISION_ACTION_TYPE: &str = "config.revision";

/// Versioned, atomically-swapped configuration snapshot.
///
/// Owned by the meta-loop; every applied revision is persisted to
/// `revisions/<version>.json` and folded into the snapshot subscribers
/// read through a watch channel.
pub struct ConfigStore {
    revisions_dir: PathBuf,
    settings_tx: watch::Sender<Arc<Map<String, Value>>>,
    applied: RwLock<Vec<ConfigRevision>>,
}

impl ConfigStore {
    /// Open the store, replaying any revisions already on disk (sorted by
    /// version) over the initial settings.
    pub async fn open(
        revisions_dir: impl AsRef<Path>,
        initial: Map<String, Value>,
    ) -> DomainResult<Self> {
        let revisions_dir = revisions_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&revisions_dir).await?;

        let mut revisions: Vec<ConfigRevision> = Vec::new();
        let mut dir = tokio::fs::read_dir(&revisions_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<ConfigRevision>(&raw) {
                Ok(revision) => revisions.push(revision),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping unreadable revision"),
            }
        }
        revisions.sort_by(|a, b| a.version.cmp(&b.version));

        let mut settings = initial;
        for revision in &revisions {
            revision.apply_to(&mut settings);
        }

        let (settings_tx, _) = watch::channel(Arc::new(settings));
        Ok(Self {
            revisions_dir,
            settings_tx,
            applied: RwLock::new(revisions),
        })
    }

    /// Apply a revision: persist it, fold its diff into the snapshot, and
    /// swap the snapshot atomically.
    pub async fn apply(&self, mut revision: ConfigRevision, at: chrono::DateTime<chrono::Utc>) -> DomainResult<ConfigRevision> {
        {
            let applied = self.applied.read().await;
            if let Some(last) = applied.last() {
                if revision.version <= last.version {
                    return Err(DomainError::ValidationFailed(format!(
                        "revision {} is not newer than applied {}",
                        revision.version, last.version
                    )));
                }
            }
        }
        revision.applied_at = Some(at);

        let path = self.revisions_dir.join(format!("{}.json", revision.version));
        let body = serde_json::to_string_pretty(&revision)?;
        tokio::fs::write(&path, body).await?;

        self.settings_tx.send_modify(|settings| {
            let mut next = (**settings).clone();
            revision.apply_to(&mut next);
            *settings = Arc::new(next);
        });
        self.applied.write().await.push(revision.clone());
        info!(version = %revision.version, component = %revision.component, "config revision applied");
        Ok(revision)
    }

    /// Current snapshot; cheap to clone, safe to read mid-revision.
    pub fn current(&self) -> Arc<Map<String, Value>> {
        self.settings_tx.borrow().clone()
    }

    /// Subscribe to snapshot swaps.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Map<String, Value>>> {
        self.settings_tx.subscribe()
    }

    pub async fn applied_revisions(&self) -> Vec<ConfigRevision> {
        self.applied.read().await.clone()
    }

    /// Find an applied revision by version.
    pub async fn get(&self, version: &str) -> Option<ConfigRevision> {
        self.applied
            .read()
            .await
            .iter()
            .find(|r| r.version == version)
            .cloned()
    }

    /// Mark an applied revision as reverted (the inverse revision carries
    /// the actual settings change).
    pub async fn mark_reverted(&self, version: &str, at: chrono::DateTime<chrono::Utc>) {
        let mut applied = self.applied.write().await;
        if let Some(revision) = applied.iter_mut().find(|r| r.version == version) {
            revision.reverted_at = Some(at);
        }
    }
}

/// The meta-loop service.
pub struct MetaLoop {
    config: MetaLoopConfig,
    incidents: Arc<IncidentLog>,
    governance: Arc<GovernanceGate>,
    publisher: Arc<UnifiedPublisher>,
    store: Arc<ConfigStore>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetaLoop {
    pub fn new(
        config: MetaLoopConfig,
        incidents: Arc<IncidentLog>,
        governance: Arc<GovernanceGate>,
        publisher: Arc<UnifiedPublisher>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            config,
            incidents,
            governance,
            publisher,
            store,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic learning loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = Duration::from_millis(self.config.interval_ms.max(10));
        let meta = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "meta loop started");
            while meta.running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !meta.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = meta.run_cycle().await {
                    warn!(error = %e, "meta loop cycle failed");
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// One aggregation-and-proposal cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> DomainResult<usize> {
        let clock = self.publisher.clock();
        let now = clock.now_utc();
        let window_start = now - ChronoDuration::seconds(self.config.window_secs);
        let stats = self.incidents.stats(Some(window_start))?;
        let success_rates = self.incidents.playbook_success_rates(Some(window_start))?;

        let mut proposals = 0usize;
        for (mode, mode_stats) in &stats.by_mode {
            if mode_stats.resolved < self.config.min_sample {
                continue;
            }
            let Some(growth) = mttr_growth(&mode_stats.mttr_samples) else {
                continue;
            };
            if growth < self.config.mttr_growth_factor {
                continue;
            }

            // MTTR regressing for this mode: tune the guardian cadence and
            // leave a revertible, governed trace of the change.
            let settings = self.store.current();
            let old_interval = settings
                .get("guardian.scan_interval_ms")
                .and_then(Value::as_u64)
                .unwrap_or(30_000);
            let new_interval = (old_interval * 2).min(600_000);
            if new_interval == old_interval {
                continue;
            }

            let revision = ConfigRevision::new(
                "guardian",
                now,
                format!(
                    "avg MTTR for {} grew {:.1}x over the last {}s window",
                    mode.as_str(),
                    growth,
                    self.config.window_secs
                ),
            )
            .with_change(
                "guardian.scan_interval_ms",
                json!(old_interval),
                json!(new_interval),
            );

            if self.propose_and_apply(revision).await?.is_some() {
                proposals += 1;
            }
        }

        let mut payload = Map::new();
        payload.insert("incidents_in_window".to_string(), json!(stats.total_incidents));
        payload.insert("proposals".to_string(), json!(proposals));
        payload.insert(
            "playbooks_tracked".to_string(),
            json!(success_rates.len()),
        );
        self.publisher
            .publish_typed(
                EventType::MetaCycleCompleted,
                payload,
                "meta_loop",
                PublishOpts::default(),
            )
            .await?;
        Ok(proposals)
    }

    /// Route a revision through governance and apply it when approved.
    pub async fn propose_and_apply(
        &self,
        revision: ConfigRevision,
    ) -> DomainResult<Option<ConfigRevision>> {
        let mut payload = Map::new();
        payload.insert("version".to_string(), json!(revision.version));
        payload.insert("component".to_string(), json!(revision.component));
        payload.insert("rationale".to_string(), json!(revision.rationale));
        self.publisher
            .publish_typed(
                EventType::MetaProposalCreated,
                payload,
                "meta_loop",
                PublishOpts::default(),
            )
            .await?;

        let action = ProposedAction::new(
            REVISION_ACTION_TYPE,
            "meta_loop",
            format!("config:{}:{}", revision.component, revision.version),
        );
        let decision = self.governance.authorize(&action).await?;
        if decision.decision.is_deny() {
            info!(version = %revision.version, reason = %decision.reason, "revision denied");
            return Ok(None);
        }

        let mut revision = revision;
        // Wall-clock versions tick in seconds; two proposals inside one
        // second would collide, so bump past the last applied version.
        if let Some(last) = self.store.applied_revisions().await.last() {
            if revision.version <= last.version {
                let mut at = self.publisher.clock().now_utc();
                while ConfigRevision::version_for(at) <= last.version {
                    at += ChronoDuration::seconds(1);
                }
                revision.version = ConfigRevision::version_for(at);
            }
        }
        revision.approved_by_decision = Some(decision.id);
        let now = self.publisher.clock().now_utc();
        let applied = self.store.apply(revision, now).await?;

        let mut payload = Map::new();
        payload.insert("version".to_string(), json!(applied.version));
        payload.insert("component".to_string(), json!(applied.component));
        self.publisher
            .publish_typed(
                EventType::ConfigRevisionApplied,
                payload,
                "meta_loop",
                PublishOpts::default(),
            )
            .await?;
        Ok(Some(applied))
    }

    /// Revert an applied revision; the revert is a governed revision too.
    pub async fn revert(&self, version: &str) -> DomainResult<Option<ConfigRevision>> {
        let original = self
            .store
            .get(version)
            .await
            .ok_or_else(|| DomainError::ValidationFailed(format!("unknown revision {version}")))?;
        let now = self.publisher.clock().now_utc();
        let inverse = original.inverse(now);

        let Some(applied) = self.propose_and_apply(inverse).await? else {
            return Ok(None);
        };
        self.store.mark_reverted(version, now).await;

        let mut payload = Map::new();
        payload.insert("version".to_string(), json!(version));
        payload.insert("reverted_by".to_string(), json!(applied.version));
        self.publisher
            .publish_typed(
                EventType::ConfigRevisionReverted,
                payload,
                "meta_loop",
                PublishOpts::default(),
            )
            .await?;
        Ok(Some(applied))
    }
}

/// Ratio of the mean of the newest half of samples to the oldest half.
fn mttr_growth(samples: &[f64]) -> Option<f64> {
    if samples.len() < 4 {
        return None;
    }
    let mid = samples.len() / 2;
    let (old, new) = samples.split_at(mid);
    let old_avg = old.iter().sum::<f64>() / old.len() as f64;
    let new_avg = new.iter().sum::<f64>() / new.len() as f64;
    if old_avg <= f64::EPSILON {
        return None;
    }
    Some(new_avg / old_avg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::GovernanceConfig;
    use crate::domain::models::event::EventSeverity;
    use crate::domain::models::incident::{FailureMode, Incident, IncidentStatus};
    use crate::domain::ports::approvals::NullApprovalChannel;
    use crate::domain::ports::clock::{Clock, SystemClock};
    use crate::services::audit_log::AuditLog;
    use crate::services::event_bus::EventBus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn initial_settings() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("guardian.scan_interval_ms".to_string(), json!(30_000u64));
        map
    }

    async fn meta_fixture(config: MetaLoopConfig) -> (MetaLoop, Arc<ConfigStore>, Arc<IncidentLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let publisher = Arc::new(UnifiedPublisher::new(bus, audit, clock));
        let incidents = Arc::new(
            IncidentLog::open(dir.path().join("incidents.jsonl"))
                .await
                .unwrap(),
        );
        let governance = Arc::new(GovernanceGate::new(
            GovernanceConfig {
                whitelisted_toggles: vec![REVISION_ACTION_TYPE.to_string()],
                ..GovernanceConfig::default()
            },
            Arc::new(NullApprovalChannel),
            Arc::clone(&publisher),
        ));
        let store = Arc::new(
            ConfigStore::open(dir.path().join("revisions"), initial_settings())
                .await
                .unwrap(),
        );
        let meta = MetaLoop::new(
            config,
            Arc::clone(&incidents),
            governance,
            publisher,
            Arc::clone(&store),
        );
        (meta, store, incidents, dir)
    }

    fn resolved_incident(mode: FailureMode, mttr_secs: i64) -> Vec<Incident> {
        let mut incident = Incident::new(mode, EventSeverity::Warn, Utc::now());
        let detected = incident.clone();
        incident.transition(IncidentStatus::InProgress).unwrap();
        incident
            .resolve(incident.detected_at + ChronoDuration::seconds(mttr_secs))
            .unwrap();
        vec![detected, incident]
    }

    #[test]
    fn test_mttr_growth_detection() {
        assert!(mttr_growth(&[1.0, 1.0]).is_none());
        let flat = mttr_growth(&[2.0, 2.0, 2.0, 2.0]).unwrap();
        assert!((flat - 1.0).abs() < 1e-9);
        let tripled = mttr_growth(&[1.0, 1.0, 3.0, 3.0]).unwrap();
        assert!((tripled - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_store_apply_and_snapshot_swap() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("revisions"), initial_settings())
            .await
            .unwrap();
        let mut watcher = store.subscribe();

        let revision = ConfigRevision::new("guardian", Utc::now(), "test")
            .with_change("guardian.scan_interval_ms", json!(30_000), json!(60_000));
        let version = revision.version.clone();
        store.apply(revision, Utc::now()).await.unwrap();

        watcher.changed().await.unwrap();
        assert_eq!(
            store.current()["guardian.scan_interval_ms"],
            json!(60_000)
        );
        // Persisted to disk under the version name.
        assert!(dir
            .path()
            .join("revisions")
            .join(format!("{version}.json"))
            .exists());
    }

    #[tokio::test]
    async fn test_store_rejects_non_monotonic_versions() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path().join("revisions"), Map::new())
            .await
            .unwrap();
        let t1 = Utc::now();
        let newer = ConfigRevision::new("x", t1 + ChronoDuration::seconds(5), "newer");
        let older = ConfigRevision::new("x", t1, "older");
        store.apply(newer, Utc::now()).await.unwrap();
        assert!(store.apply(older, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_store_replays_revisions_on_open() {
        let dir = TempDir::new().unwrap();
        let revisions_dir = dir.path().join("revisions");
        {
            let store = ConfigStore::open(&revisions_dir, initial_settings()).await.unwrap();
            let revision = ConfigRevision::new("guardian", Utc::now(), "test")
                .with_change("guardian.scan_interval_ms", json!(30_000), json!(90_000));
            store.apply(revision, Utc::now()).await.unwrap();
        }
        let reopened = ConfigStore::open(&revisions_dir, initial_settings()).await.unwrap();
        assert_eq!(
            reopened.current()["guardian.scan_interval_ms"],
            json!(90_000)
        );
    }

    #[tokio::test]
    async fn test_cycle_proposes_on_mttr_regression() {
        let config = MetaLoopConfig {
            min_sample: 10,
            mttr_growth_factor: 3.0,
            window_secs: 3600,
            ..MetaLoopConfig::default()
        };
        let (meta, store, incidents, _dir) = meta_fixture(config).await;

        // Ten resolved time_wait incidents whose MTTR grows 3x+.
        for i in 0..10 {
            let mttr = if i < 5 { 2 } else { 8 };
            for record in resolved_incident(FailureMode::TimeWaitBuildup, mttr) {
                incidents.append(&record).unwrap();
            }
        }

        let proposals = meta.run_cycle().await.unwrap();
        assert_eq!(proposals, 1);
        assert_eq!(
            store.current()["guardian.scan_interval_ms"],
            json!(60_000u64)
        );
        let applied = store.applied_revisions().await;
        assert_eq!(applied.len(), 1);
        assert!(applied[0].approved_by_decision.is_some());
    }

    #[tokio::test]
    async fn test_cycle_quiet_below_sample_floor() {
        let config = MetaLoopConfig {
            min_sample: 10,
            ..MetaLoopConfig::default()
        };
        let (meta, store, incidents, _dir) = meta_fixture(config).await;
        for record in resolved_incident(FailureMode::TimeWaitBuildup, 9) {
            incidents.append(&record).unwrap();
        }
        let proposals = meta.run_cycle().await.unwrap();
        assert_eq!(proposals, 0);
        assert!(store.applied_revisions().await.is_empty());
    }

    #[tokio::test]
    async fn test_revert_is_governed_and_applies_inverse() {
        let (meta, store, _incidents, _dir) = meta_fixture(MetaLoopConfig::default()).await;

        let revision = ConfigRevision::new("guardian", Utc::now(), "tune")
            .with_change("guardian.scan_interval_ms", json!(30_000), json!(60_000));
        let applied = meta.propose_and_apply(revision).await.unwrap().unwrap();
        assert_eq!(store.current()["guardian.scan_interval_ms"], json!(60_000));

        let reverted = meta.revert(&applied.version).await.unwrap().unwrap();
        assert_eq!(store.current()["guardian.scan_interval_ms"], json!(30_000));
        assert_eq!(reverted.reverts_version.as_deref(), Some(applied.version.as_str()));
        assert!(store.get(&applied.version).await.unwrap().reverted_at.is_some());
    }
}
