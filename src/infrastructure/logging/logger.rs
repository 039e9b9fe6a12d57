//! Logger initialization using tracing.

use anyhow::Result;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::config::LoggingConfig;

/// Logger handle; dropping the guard flushes the file appender.
pub struct Logger {
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Initialize the global subscriber.
    ///
    /// File output is always JSON under `<log_dir>/graced.log` (daily
    /// rotation); stdout respects the configured format.
    pub fn init(config: &LoggingConfig, log_dir: Option<&Path>) -> Result<Self> {
        let default_level = parse_log_level(&config.level)?;
        let env_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        let guard = if let Some(log_dir) = log_dir {
            let file_appender = rolling::daily(log_dir, "graced.log");
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter);

            if config.enable_stdout {
                let stdout_filter = EnvFilter::builder()
                    .with_default_directive(default_level.into())
                    .from_env_lossy();
                if config.format == "json" {
                    tracing_subscriber::registry()
                        .with(file_layer)
                        .with(
                            tracing_subscriber::fmt::layer()
                                .json()
                                .with_writer(io::stdout)
                                .with_filter(stdout_filter),
                        )
                        .try_init()?;
                } else {
                    tracing_subscriber::registry()
                        .with(file_layer)
                        .with(
                            tracing_subscriber::fmt::layer()
                                .with_writer(io::stdout)
                                .with_filter(stdout_filter),
                        )
                        .try_init()?;
                }
            } else {
                tracing_subscriber::registry().with(file_layer).try_init()?;
            }
            Some(guard)
        } else {
            if config.format == "json" {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(io::stdout)
                            .with_filter(env_filter),
                    )
                    .try_init()?;
            } else {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(io::stdout)
                            .with_filter(env_filter),
                    )
                    .try_init()?;
            }
            None
        };

        Ok(Self { _guard: guard })
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("unknown log level: {other}"),
    }
}
