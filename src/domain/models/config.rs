//! Control-plane configuration model.
//!
//! Nested sections with defaults; loaded by the figment-based loader and
//! overridable through the recognized flat environment options.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraceConfig {
    /// Preferred listening port; when unset the guardian scans upward from
    /// `guardian.port_scan_start`.
    pub port: Option<u16>,
    /// Skip outbound network calls; guardian probes become local-only.
    pub offline_mode: bool,
    /// Implies offline mode plus a deterministic clock.
    pub ci_mode: bool,
    /// Continue into degraded boot instead of exiting on a broken audit chain.
    pub allow_degraded_start: bool,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub bus: BusConfig,
    pub guardian: GuardianConfig,
    pub htm: HtmConfig,
    pub governance: GovernanceConfig,
    pub meta_loop: MetaLoopConfig,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub enable_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            enable_stdout: true,
        }
    }
}

/// Persisted state layout rooted at the log directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Base path for audit/incident/task logs (`GRACE_LOG_DIR`).
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(".grace/logs"),
        }
    }
}

impl PathsConfig {
    pub fn audit_log(&self) -> PathBuf {
        self.log_dir.join("audit").join("immutable_audit.jsonl")
    }

    pub fn incident_log(&self) -> PathBuf {
        self.log_dir.join("incidents").join("incidents.jsonl")
    }

    pub fn task_journal(&self) -> PathBuf {
        self.log_dir.join("tasks").join("htm_tasks.jsonl")
    }

    pub fn revisions_dir(&self) -> PathBuf {
        self.log_dir.join("config").join("revisions")
    }
}

/// Event bus section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber bounded queue capacity.
    pub queue_capacity: usize,
    /// Consecutive full-queue blocks on critical events before the bus
    /// raises `bus.saturation` and degrades non-critical subscribers.
    pub saturation_threshold: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            saturation_threshold: 3,
        }
    }
}

/// Guardian section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Watchdog cadence (`GUARDIAN_SCAN_INTERVAL_MS`).
    pub scan_interval_ms: u64,
    /// First port tried when `port` is unset.
    pub port_scan_start: u16,
    /// Exclusive upper bound of the boot-gate port scan.
    pub port_scan_end: u16,
    /// TIME_WAIT socket count considered a buildup.
    pub time_wait_threshold: usize,
    /// CLOSE_WAIT socket count considered a leak.
    pub close_wait_threshold: usize,
    /// Fraction of the fd limit considered pressure.
    pub fd_pressure_ratio: f64,
    /// Fraction of the ephemeral port range considered exhaustion.
    pub ephemeral_usage_ratio: f64,
    /// Hostname resolved by the DNS probe.
    pub dns_probe_host: String,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 30_000,
            port_scan_start: 8000,
            port_scan_end: 8100,
            time_wait_threshold: 1024,
            close_wait_threshold: 128,
            fd_pressure_ratio: 0.9,
            ephemeral_usage_ratio: 0.9,
            dns_probe_host: "localhost".to_string(),
        }
    }
}

/// HTM scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmConfig {
    /// Worker pool size (`HTM_MAX_WORKERS`).
    pub max_workers: usize,
    /// Default SLA applied to tasks that do not set one (`HTM_DEFAULT_SLA_MS`).
    pub default_sla_ms: u64,
    /// Default attempt cap (`HTM_MAX_ATTEMPTS`).
    pub max_attempts: u32,
    /// Grace period for cooperative cancellation before force-termination.
    pub cancel_grace_ms: u64,
}

impl Default for HtmConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_sla_ms: 30_000,
            max_attempts: 3,
            cancel_grace_ms: 5_000,
        }
    }
}

/// Governance gate section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Tier for action types the classification table does not know
    /// (`GOVERNANCE_DEFAULT_TIER`).
    pub default_tier: String,
    /// Deadline for user/admin approvals (`GOVERNANCE_APPROVAL_TIMEOUT_MS`).
    pub approval_timeout_ms: u64,
    /// Action types treated as idempotent whitelisted toggles (T1 auto).
    pub whitelisted_toggles: Vec<String>,
    /// Action types eligible for the trust-based T2 -> T1 relaxation.
    pub trust_relaxable: Vec<String>,
    /// Minimum trust score for the relaxation to apply.
    pub trust_threshold: f64,
    /// Substring deny patterns checked before anything else.
    pub deny_patterns: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            default_tier: "t2".to_string(),
            approval_timeout_ms: 300_000,
            whitelisted_toggles: Vec::new(),
            trust_relaxable: Vec::new(),
            trust_threshold: 0.9,
            deny_patterns: vec![
                "rm -rf /".to_string(),
                "eval(".to_string(),
                "curl | sh".to_string(),
            ],
        }
    }
}

/// Meta-loop section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaLoopConfig {
    /// Cadence of the learning loop (`META_LOOP_INTERVAL_MS`).
    pub interval_ms: u64,
    /// Lookback window for outcome aggregation, in seconds.
    pub window_secs: i64,
    /// MTTR growth factor that triggers a tuning proposal.
    pub mttr_growth_factor: f64,
    /// Minimum resolved incidents of one mode before proposing anything.
    pub min_sample: usize,
}

impl Default for MetaLoopConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            window_secs: 3600,
            mttr_growth_factor: 3.0,
            min_sample: 10,
        }
    }
}
