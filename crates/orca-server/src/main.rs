//! orca-server - Orca session worker
//!
//! Runs consent-gated analysis sessions for requests read from stdin and
//! drains in-flight sessions on shutdown.

use clap::Parser;
use orca_core::{DrainOutcome, ShutdownReason};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod config;
mod intake;
mod maintenance;
mod provider;
mod signals;
mod state;

use cli::Cli;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging. stdout carries results, so logs go to stderr.
    let filter = EnvFilter::from_default_env()
        .add_directive("orca_server=info".parse()?)
        .add_directive("orca_core=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    info!("orca-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::Config::load(cli.config.as_deref(), cli.database.as_deref())?;
    info!(
        config = %config.config_path.display(),
        database = %config.database_path.display(),
        providers = config.file.providers.len(),
        "Config loaded"
    );

    let state = AppState::open(config)?;
    let trigger = state.trigger();

    signals::SignalListener::install()?.spawn(trigger.clone());

    let supervisor = {
        let drain = state.drain.clone();
        tokio::spawn(async move { drain.run().await })
    };

    let purge = state.config.file.maintenance.purge_interval().map(|period| {
        maintenance::spawn_purge_task(state.store.clone(), period, state.coordinator.lifecycle())
    });

    let worker = match cli.once {
        Some(subject_id) => tokio::spawn(run_once(state.clone(), subject_id)),
        None => tokio::spawn(run_worker(state.clone())),
    };

    let report = supervisor.await?;
    worker.abort();
    if let Some(purge) = purge {
        let _ = purge.await;
    }

    let Some(report) = report else {
        warn!("Drain did not run");
        return Ok(());
    };
    info!(
        reason = ?report.reason,
        outcome = ?report.outcome,
        drained = report.drained,
        finalized = report.finalized,
        failed_writes = report.failed_writes,
        elapsed_ms = report.elapsed_ms,
        uptime_secs = state.start_time.elapsed().as_secs(),
        "Shutdown complete"
    );

    if report.outcome == DrainOutcome::DeadlineExceeded {
        anyhow::bail!("Drain exceeded its deadline; some sessions were not persisted");
    }
    Ok(())
}

/// Run one session, print its result, then request shutdown.
async fn run_once(state: Arc<AppState>, subject_id: String) {
    let result = state.coordinator.run_session(&subject_id).await;
    let response = intake::IntakeResponse::from_result(subject_id, result);

    let mut stdout = tokio::io::stdout();
    if let Err(e) = intake::write_line(&mut stdout, &response).await {
        error!(error = %e, "Failed to write result");
    }
    state.trigger().trigger(ShutdownReason::Requested);
}

/// Serve stdin until end of input, then request shutdown. A failed or
/// panicked intake is reported as a fault.
async fn run_worker(state: Arc<AppState>) {
    let coordinator = state.coordinator.clone();
    let intake = tokio::spawn(async move {
        let reader = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        intake::run(coordinator, reader, &mut stdout).await
    });

    let result = intake.await;
    let reason = match signals::fault_reason("intake", &result) {
        Some(reason) => {
            error!(reason = ?reason, "Intake stopped unexpectedly");
            reason
        }
        None => {
            if let Ok(Ok(stats)) = &result {
                info!(
                    accepted = stats.accepted,
                    succeeded = stats.succeeded,
                    failed = stats.failed,
                    invalid = stats.invalid,
                    "Intake finished"
                );
            }
            ShutdownReason::Requested
        }
    };
    state.trigger().trigger(reason);
}
