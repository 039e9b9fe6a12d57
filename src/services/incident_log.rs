//! Durable incident log.
//!
//! Append-only JSONL: an incident is first appended as `detected`, and each
//! later transition appends a fresh record sharing the same `incident_id`.
//! Readers fold by id, taking the latest record for current status; MTTR
//! pairs the earliest `detected` with the terminal record.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::incident::{FailureMode, Incident, IncidentStatus};

/// Aggregate statistics for one failure mode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeStats {
    pub detected: usize,
    pub resolved: usize,
    pub failed: usize,
    pub escalated: usize,
    /// MTTR samples (seconds) of resolved incidents, oldest first.
    pub mttr_samples: Vec<f64>,
}

impl ModeStats {
    pub fn avg_mttr(&self) -> Option<f64> {
        if self.mttr_samples.is_empty() {
            return None;
        }
        Some(self.mttr_samples.iter().sum::<f64>() / self.mttr_samples.len() as f64)
    }

    pub fn success_rate(&self) -> Option<f64> {
        let terminal = self.resolved + self.failed + self.escalated;
        if terminal == 0 {
            return None;
        }
        Some(self.resolved as f64 / terminal as f64)
    }
}

/// Aggregate statistics over a window of the incident log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentStats {
    pub total_incidents: usize,
    pub open_incidents: usize,
    pub by_mode: HashMap<FailureMode, ModeStats>,
}

/// The incident log service; sole writer of the incidents file.
pub struct IncidentLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl IncidentLog {
    /// Open (or create) the incident log, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Append the current state of an incident as a complete record.
    pub fn append(&self, incident: &Incident) -> DomainResult<()> {
        let line = serde_json::to_string(incident)?;
        let mut file = self
            .file
            .lock()
            .map_err(|e| DomainError::ValidationFailed(format!("incident log poisoned: {e}")))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        info!(
            incident_id = %incident.incident_id,
            status = incident.status.as_str(),
            failure_mode = incident.failure_mode.as_str(),
            "incident record appended"
        );
        Ok(())
    }

    /// All records in file order. A parse failure is an integrity error.
    pub fn records(&self) -> DomainResult<Vec<Incident>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Incident = serde_json::from_str(&line).map_err(|e| {
                DomainError::IncidentSchemaBroken(format!("line {}: {e}", idx + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Fold records by id: the latest record per incident wins, but
    /// `detected_at` always comes from the earliest sighting.
    pub fn fold(&self) -> DomainResult<HashMap<Uuid, Incident>> {
        let mut folded: HashMap<Uuid, Incident> = HashMap::new();
        for record in self.records()? {
            match folded.get_mut(&record.incident_id) {
                None => {
                    folded.insert(record.incident_id, record);
                }
                Some(existing) => {
                    let first_detected = existing.detected_at.min(record.detected_at);
                    *existing = record;
                    existing.detected_at = first_detected;
                }
            }
        }
        Ok(folded)
    }

    /// Current state of one incident.
    pub fn current(&self, incident_id: Uuid) -> DomainResult<Option<Incident>> {
        Ok(self.fold()?.remove(&incident_id))
    }

    /// Aggregate statistics for incidents detected in `[since, now]`
    /// (everything when `since` is None).
    pub fn stats(&self, since: Option<DateTime<Utc>>) -> DomainResult<IncidentStats> {
        let folded = self.fold()?;
        let mut stats = IncidentStats::default();

        let mut incidents: Vec<&Incident> = folded
            .values()
            .filter(|i| since.is_none_or(|s| i.detected_at >= s))
            .collect();
        // Oldest first so MTTR samples form a time series.
        incidents.sort_by_key(|i| i.detected_at);

        for incident in incidents {
            stats.total_incidents += 1;
            if !incident.status.is_terminal() {
                stats.open_incidents += 1;
            }
            let mode = stats.by_mode.entry(incident.failure_mode).or_default();
            mode.detected += 1;
            match incident.status {
                IncidentStatus::Resolved => {
                    mode.resolved += 1;
                    if let Some(mttr) = incident.mttr_seconds {
                        mode.mttr_samples.push(mttr);
                    }
                }
                IncidentStatus::Failed => mode.failed += 1,
                IncidentStatus::Escalated => mode.escalated += 1,
                IncidentStatus::Detected | IncidentStatus::InProgress => {}
            }
        }
        Ok(stats)
    }

    /// Historical success rate per playbook: resolved / terminal incidents
    /// that ran it. Used to rank candidate playbooks.
    pub fn playbook_success_rates(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> DomainResult<HashMap<String, f64>> {
        let folded = self.fold()?;
        let mut tallies: HashMap<String, (usize, usize)> = HashMap::new();
        for incident in folded.values() {
            if since.is_some_and(|s| incident.detected_at < s) {
                continue;
            }
            let Some(playbook_id) = &incident.playbook_id else {
                continue;
            };
            if !incident.status.is_terminal() {
                continue;
            }
            let entry = tallies.entry(playbook_id.clone()).or_insert((0, 0));
            entry.1 += 1;
            if incident.status == IncidentStatus::Resolved {
                entry.0 += 1;
            }
        }
        Ok(tallies
            .into_iter()
            .map(|(id, (resolved, total))| (id, resolved as f64 / total as f64))
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::EventSeverity;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn log() -> (IncidentLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let log = IncidentLog::open(dir.path().join("incidents.jsonl"))
            .await
            .unwrap();
        (log, dir)
    }

    fn incident(mode: FailureMode) -> Incident {
        Incident::new(mode, EventSeverity::Warn, Utc::now())
    }

    #[tokio::test]
    async fn test_fold_takes_latest_record() {
        let (log, _dir) = log().await;
        let mut inc = incident(FailureMode::ZombieProcess);
        log.append(&inc).unwrap();

        inc.transition(IncidentStatus::InProgress).unwrap();
        log.append(&inc).unwrap();

        let resolved_at = inc.detected_at + Duration::milliseconds(800);
        inc.resolve(resolved_at).unwrap();
        log.append(&inc).unwrap();

        let folded = log.fold().unwrap();
        assert_eq!(folded.len(), 1);
        let current = &folded[&inc.incident_id];
        assert_eq!(current.status, IncidentStatus::Resolved);
        assert!((current.mttr_seconds.unwrap() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fold_keeps_earliest_detection() {
        let (log, _dir) = log().await;
        let mut inc = incident(FailureMode::DnsFailure);
        let first_seen = inc.detected_at;
        log.append(&inc).unwrap();

        // A later record claiming a newer detected_at must not move MTTR's
        // anchor point.
        inc.detected_at = first_seen + Duration::seconds(30);
        inc.transition(IncidentStatus::InProgress).unwrap();
        log.append(&inc).unwrap();

        let folded = log.fold().unwrap();
        assert_eq!(folded[&inc.incident_id].detected_at, first_seen);
    }

    #[tokio::test]
    async fn test_stats_by_mode() {
        let (log, _dir) = log().await;

        for i in 1..=3i64 {
            let mut inc = incident(FailureMode::TimeWaitBuildup);
            log.append(&inc).unwrap();
            inc.transition(IncidentStatus::InProgress).unwrap();
            inc.resolve(inc.detected_at + Duration::seconds(i)).unwrap();
            log.append(&inc).unwrap();
        }
        let mut failed = incident(FailureMode::ZombieProcess);
        log.append(&failed).unwrap();
        failed.transition(IncidentStatus::Failed).unwrap();
        log.append(&failed).unwrap();

        let stats = log.stats(None).unwrap();
        assert_eq!(stats.total_incidents, 4);
        assert_eq!(stats.open_incidents, 0);

        let tw = &stats.by_mode[&FailureMode::TimeWaitBuildup];
        assert_eq!(tw.resolved, 3);
        assert_eq!(tw.mttr_samples.len(), 3);
        assert!((tw.avg_mttr().unwrap() - 2.0).abs() < 1e-9);
        assert!((tw.success_rate().unwrap() - 1.0).abs() < f64::EPSILON);

        let zp = &stats.by_mode[&FailureMode::ZombieProcess];
        assert_eq!(zp.failed, 1);
        assert!((zp.success_rate().unwrap() - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_integrity_error() {
        let (log, dir) = log().await;
        log.append(&incident(FailureMode::FdPressure)).unwrap();
        // Append a malformed line behind the log's back.
        let path = dir.path().join("incidents.jsonl");
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(raw, "{{\"not\": \"an incident\"}}").unwrap();

        let err = log.records().unwrap_err();
        assert!(matches!(err, DomainError::IncidentSchemaBroken(_)));
    }

    #[tokio::test]
    async fn test_stats_window_filter() {
        let (log, _dir) = log().await;
        let mut old = incident(FailureMode::CloseWaitLeak);
        old.detected_at = Utc::now() - Duration::hours(5);
        log.append(&old).unwrap();
        log.append(&incident(FailureMode::CloseWaitLeak)).unwrap();

        let stats = log.stats(Some(Utc::now() - Duration::hours(1))).unwrap();
        assert_eq!(stats.total_incidents, 1);
    }
}
