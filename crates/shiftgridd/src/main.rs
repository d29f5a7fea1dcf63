//! shiftgridd — the ShiftGrid daemon.
//!
//! Single binary that assembles the rollout subsystems:
//! - State store (redb)
//! - Workload gateway
//! - Step scheduler
//! - Convergence engine, driven by a polling loop
//!
//! The polling loop is a deliberately simple trigger source: every
//! interval it reconciles each stored rollout in turn, which gives the
//! engine the at-least-once, per-identity-serialized delivery it
//! expects. Rollouts whose pass lost a write race get one immediate
//! extra pass.
//!
//! # Usage
//!
//! ```text
//! shiftgridd run --data-dir /var/lib/shiftgrid --poll-interval 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use shiftgrid_engine::ConvergenceEngine;
use shiftgrid_scheduler::StepScheduler;
use shiftgrid_state::{SharedGateway, StateStore, StoreGateway};

#[derive(Parser)]
#[command(name = "shiftgridd", about = "ShiftGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rollout control loop.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/shiftgrid")]
        data_dir: PathBuf,

        /// Reconcile poll interval in seconds.
        #[arg(long, default_value = "10")]
        poll_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shiftgridd=debug,shiftgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            poll_interval,
        } => run(data_dir, poll_interval).await,
    }
}

async fn run(data_dir: PathBuf, poll_interval: u64) -> anyhow::Result<()> {
    info!("ShiftGrid daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("shiftgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let gateway: SharedGateway = Arc::new(StoreGateway::new(store.clone()));
    let scheduler = Arc::new(StepScheduler::new(gateway.clone()));
    let engine = ConvergenceEngine::new(gateway, scheduler.clone());
    info!("convergence engine initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── Polling driver loop ────────────────────────────────────

    info!(interval = poll_interval, "reconcile loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(poll_interval)) => {
                reconcile_all(&store, &engine).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    scheduler.shutdown().await;
    info!("ShiftGrid daemon stopped");
    Ok(())
}

/// One poll pass: reconcile every stored rollout, sequentially.
async fn reconcile_all(store: &StateStore, engine: &ConvergenceEngine) {
    let rollouts = match store.list_rollouts() {
        Ok(rollouts) => rollouts,
        Err(e) => {
            warn!(error = %e, "failed to list rollouts");
            return;
        }
    };

    for rollout in rollouts {
        let id = rollout.id();
        match engine.reconcile(&id).await {
            Ok(outcome) if outcome.requeue => {
                // One immediate retry; anything still stale waits for
                // the next poll.
                if let Err(e) = engine.reconcile(&id).await {
                    warn!(%id, error = %e, "requeued reconcile failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%id, error = %e, "reconcile failed"),
        }
    }
}
