//! Versioned configuration revisions proposed by the meta-loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One changed setting inside a revision diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingChange {
    pub key: String,
    pub old: Value,
    pub new: Value,
}

/// A governed, versioned, revertible configuration change.
///
/// Versions are wall-clock derived (`v<YYYYMMDD>.<HHMMSS>`) and strictly
/// monotonic per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRevision {
    pub component: String,
    pub version: String,
    pub diff: Vec<SettingChange>,
    /// Governance decision id that approved this revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by_decision: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
    /// Version this revision reverts, when it is itself a revert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts_version: Option<String>,
    /// Why the meta-loop proposed it.
    pub rationale: String,
}

impl ConfigRevision {
    pub fn new(component: impl Into<String>, at: DateTime<Utc>, rationale: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            version: Self::version_for(at),
            diff: Vec::new(),
            approved_by_decision: None,
            applied_at: None,
            reverted_at: None,
            reverts_version: None,
            rationale: rationale.into(),
        }
    }

    /// Derive the version string for a wall-clock instant.
    pub fn version_for(at: DateTime<Utc>) -> String {
        format!("v{}", at.format("%Y%m%d.%H%M%S"))
    }

    pub fn with_change(mut self, key: impl Into<String>, old: Value, new: Value) -> Self {
        self.diff.push(SettingChange {
            key: key.into(),
            old,
            new,
        });
        self
    }

    /// Produce the inverse revision (a governed revert).
    pub fn inverse(&self, at: DateTime<Utc>) -> Self {
        let mut rev = Self::new(
            self.component.clone(),
            at,
            format!("revert of {}", self.version),
        );
        rev.reverts_version = Some(self.version.clone());
        rev.diff = self
            .diff
            .iter()
            .map(|c| SettingChange {
                key: c.key.clone(),
                old: c.new.clone(),
                new: c.old.clone(),
            })
            .collect();
        rev
    }

    /// Apply this revision's diff onto a flat settings map.
    pub fn apply_to(&self, settings: &mut Map<String, Value>) {
        for change in &self.diff {
            settings.insert(change.key.clone(), change.new.clone());
        }
    }
}
