//! graced: the Grace control-plane daemon.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use grace::domain::ports::approvals::{ApprovalChannel, ManualApprovalChannel};
use grace::domain::ports::clock::{Clock, DeterministicClock, SystemClock};
use grace::domain::ports::probe::{InMemoryProbe, SystemProbe};
use grace::infrastructure::config::ConfigLoader;
use grace::infrastructure::logging::Logger;
use grace::infrastructure::net::LinuxProbe;
use grace::services::audit_log::AuditLog;
use grace::services::boot::{BootOrchestrator, BootState};
use grace::GraceConfig;

#[derive(Parser)]
#[command(name = "graced", about = "Grace autonomous control plane", version)]
struct Cli {
    /// Path to a config file (overrides the .grace/ hierarchy).
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Force offline mode (no outbound probes).
    #[arg(long, global = true)]
    offline: bool,

    /// Force CI mode (offline + deterministic clock + in-memory probe).
    #[arg(long, global = true)]
    ci: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the control plane and run until interrupted (default).
    Run,
    /// Verify the audit chain and exit (code 4 on a broken chain).
    VerifyAudit,
    /// Print the effective configuration after all merges.
    ShowConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => runtime.block_on(run(config)),
        Command::VerifyAudit => runtime.block_on(verify_audit(config)),
        Command::ShowConfig => show_config(&config),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GraceConfig> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    if cli.offline {
        config.offline_mode = true;
    }
    if cli.ci {
        config.ci_mode = true;
        config.offline_mode = true;
    }
    Ok(config)
}

async fn run(config: GraceConfig) -> ExitCode {
    let _logger = match Logger::init(&config.logging, Some(&config.paths.log_dir)) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::from(1);
        }
    };

    let clock: Arc<dyn Clock> = if config.ci_mode {
        Arc::new(DeterministicClock::for_ci())
    } else {
        Arc::new(SystemClock::new())
    };
    let probe: Arc<dyn SystemProbe> = if config.ci_mode {
        Arc::new(InMemoryProbe::new())
    } else {
        Arc::new(LinuxProbe::new(config.guardian.clone()))
    };
    let approvals: Arc<dyn ApprovalChannel> = Arc::new(ManualApprovalChannel::new());

    let plane = match BootOrchestrator::new(config, probe, approvals, clock)
        .boot()
        .await
    {
        Ok(plane) => plane,
        Err(e) => {
            error!(error = %e, "boot failed");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match &plane.state {
        BootState::Ready => info!(port = plane.port, "graced running"),
        BootState::Degraded { failed_phase, .. } => {
            error!(failed_phase, "graced running degraded");
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    plane.shutdown().await;
    ExitCode::SUCCESS
}

async fn verify_audit(config: GraceConfig) -> ExitCode {
    let path = config.paths.audit_log();
    match AuditLog::verify_chain(&path).await {
        Ok(verification) if verification.is_intact() => {
            println!("audit chain intact: {} records", verification.records);
            ExitCode::SUCCESS
        }
        Ok(verification) => {
            let (line, detail) = verification
                .broken_at
                .unwrap_or((0, "unknown".to_string()));
            eprintln!("audit chain broken at line {line}: {detail}");
            ExitCode::from(4)
        }
        Err(e) => {
            eprintln!("could not verify audit chain: {e}");
            ExitCode::from(4)
        }
    }
}

fn show_config(config: &GraceConfig) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("could not render config: {e}");
            ExitCode::from(1)
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => futures::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
