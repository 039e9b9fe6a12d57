//! Configuration loader with hierarchical merging.
//!
//! Figment merges defaults, project YAML files, and `GRACE_`-prefixed
//! environment variables; a second pass applies the flat recognized
//! options (`GRACE_PORT`, `OFFLINE_MODE`, `CI_MODE`, `HTM_*`, ...) the
//! operator surface documents. Validation failures exit with code 2.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::models::config::GraceConfig;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid htm.max_workers: {0}. Must be between 1 and 256")]
    InvalidMaxWorkers(usize),

    #[error("Invalid htm.max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid guardian port scan range: {0}..{1}")]
    InvalidPortRange(u16, u16),

    #[error("Invalid guardian.scan_interval_ms: {0}. Must be positive")]
    InvalidScanInterval(u64),

    #[error("Invalid governance.default_tier: {0}. Must be one of: t0, t1, t2, t3")]
    InvalidDefaultTier(String),

    #[error("Invalid governance.approval_timeout_ms: {0}. Must be positive")]
    InvalidApprovalTimeout(u64),

    #[error("Invalid meta_loop.interval_ms: {0}. Must be positive")]
    InvalidMetaInterval(u64),

    #[error("Invalid environment value for {name}: {value}")]
    InvalidEnvValue { name: &'static str, value: String },

    #[error("Log directory cannot be empty")]
    EmptyLogDir,
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.grace/config.yaml` (project config)
    /// 3. `.grace/local.yaml` (local overrides, optional)
    /// 4. `GRACE_CFG_*` nested environment variables (figment `__` paths)
    /// 5. The recognized flat options (`GRACE_PORT`, `OFFLINE_MODE`, ...)
    pub fn load() -> Result<GraceConfig> {
        let mut config: GraceConfig = Figment::new()
            .merge(Serialized::defaults(GraceConfig::default()))
            .merge(Yaml::file(".grace/config.yaml"))
            .merge(Yaml::file(".grace/local.yaml"))
            .merge(Env::prefixed("GRACE_CFG_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::apply_recognized_env(&mut config)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file (plus the env options).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<GraceConfig> {
        let mut config: GraceConfig = Figment::new()
            .merge(Serialized::defaults(GraceConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::apply_recognized_env(&mut config)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// The flat, documented operator surface. These names win over
    /// everything the figment chain produced.
    pub fn apply_recognized_env(config: &mut GraceConfig) -> Result<(), ConfigError> {
        if let Some(raw) = read_env("GRACE_PORT") {
            config.port = Some(parse_env("GRACE_PORT", &raw)?);
        }
        if let Some(raw) = read_env("OFFLINE_MODE") {
            config.offline_mode = parse_bool("OFFLINE_MODE", &raw)?;
        }
        if let Some(raw) = read_env("CI_MODE") {
            config.ci_mode = parse_bool("CI_MODE", &raw)?;
        }
        if config.ci_mode {
            // CI implies offline plus deterministic clocks downstream.
            config.offline_mode = true;
        }
        if let Some(raw) = read_env("ALLOW_DEGRADED_START") {
            config.allow_degraded_start = parse_bool("ALLOW_DEGRADED_START", &raw)?;
        }
        if let Some(raw) = read_env("GRACE_LOG_DIR") {
            config.paths.log_dir = PathBuf::from(raw);
        }
        if let Some(raw) = read_env("HTM_MAX_WORKERS") {
            config.htm.max_workers = parse_env("HTM_MAX_WORKERS", &raw)?;
        }
        if let Some(raw) = read_env("HTM_DEFAULT_SLA_MS") {
            config.htm.default_sla_ms = parse_env("HTM_DEFAULT_SLA_MS", &raw)?;
        }
        if let Some(raw) = read_env("HTM_MAX_ATTEMPTS") {
            config.htm.max_attempts = parse_env("HTM_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read_env("GUARDIAN_SCAN_INTERVAL_MS") {
            config.guardian.scan_interval_ms = parse_env("GUARDIAN_SCAN_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = read_env("META_LOOP_INTERVAL_MS") {
            config.meta_loop.interval_ms = parse_env("META_LOOP_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = read_env("GOVERNANCE_DEFAULT_TIER") {
            config.governance.default_tier = raw.to_lowercase();
        }
        if let Some(raw) = read_env("GOVERNANCE_APPROVAL_TIMEOUT_MS") {
            config.governance.approval_timeout_ms =
                parse_env("GOVERNANCE_APPROVAL_TIMEOUT_MS", &raw)?;
        }
        Ok(())
    }

    /// Validate configuration after loading.
    pub fn validate(config: &GraceConfig) -> Result<(), ConfigError> {
        if config.htm.max_workers == 0 || config.htm.max_workers > 256 {
            return Err(ConfigError::InvalidMaxWorkers(config.htm.max_workers));
        }
        if config.htm.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.htm.max_attempts));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.guardian.port_scan_start >= config.guardian.port_scan_end {
            return Err(ConfigError::InvalidPortRange(
                config.guardian.port_scan_start,
                config.guardian.port_scan_end,
            ));
        }
        if config.guardian.scan_interval_ms == 0 {
            return Err(ConfigError::InvalidScanInterval(config.guardian.scan_interval_ms));
        }

        if crate::domain::models::governance::GovernanceTier::from_str(&config.governance.default_tier)
            .is_none()
        {
            return Err(ConfigError::InvalidDefaultTier(
                config.governance.default_tier.clone(),
            ));
        }
        if config.governance.approval_timeout_ms == 0 {
            return Err(ConfigError::InvalidApprovalTimeout(
                config.governance.approval_timeout_ms,
            ));
        }

        if config.meta_loop.interval_ms == 0 {
            return Err(ConfigError::InvalidMetaInterval(config.meta_loop.interval_ms));
        }

        if config.paths.log_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyLogDir);
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
        name,
        value: raw.to_string(),
    })
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvValue {
            name,
            value: raw.to_string(),
        }),
    }
}
