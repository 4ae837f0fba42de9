//! embedgridd — the Embedgrid daemon.
//!
//! Hosts one orchestrator and its proxy mesh in a single process:
//! - Session orchestrator (blueprint registry + derived caches)
//! - Proxy mesh health-check and rotation loops
//! - Periodic global metrics report
//!
//! # Usage
//!
//! ```text
//! embedgridd run --config /etc/embedgrid/embedgrid.toml --seed 100000
//! embedgridd snapshot --seed 5000
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use embedgrid_mesh::ProxyMeshManager;
use embedgrid_orchestrator::SessionOrchestrator;

use crate::config::{EmbedgridConfig, LogConfig};

#[derive(Parser)]
#[command(name = "embedgridd", about = "Embedgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run until interrupted, with the mesh loops and metrics reporter.
    Run {
        /// Path to embedgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Synthetic sessions to create at startup (overrides the config).
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Seed sessions, print global metrics as JSON, and exit.
    Snapshot {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "1000")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, seed } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(seed) = seed {
                config.seed.sessions = seed;
            }
            init_tracing(&config.log)?;
            run_daemon(config).await
        }
        Command::Snapshot { config, seed } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.log)?;
            run_snapshot(config, seed).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EmbedgridConfig> {
    match path {
        Some(path) => EmbedgridConfig::from_file(path),
        None => Ok(EmbedgridConfig::default()),
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.filter)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build(config: &EmbedgridConfig) -> (Arc<ProxyMeshManager>, Arc<SessionOrchestrator>) {
    let mesh = Arc::new(ProxyMeshManager::new(config.mesh.clone()));
    let orchestrator = Arc::new(SessionOrchestrator::new(config.orchestrator.clone(), mesh.clone()));
    (mesh, orchestrator)
}

async fn seed(orchestrator: &SessionOrchestrator, sessions: u64) {
    if sessions == 0 {
        return;
    }
    let result = orchestrator.scale_to_million(sessions).await;
    info!(
        target = result.target,
        created = result.created,
        failed = result.failed,
        batch_size = result.batch_size,
        elapsed_ms = result.elapsed_ms,
        reached = result.target_reached,
        "seeded sessions"
    );
}

async fn run_daemon(config: EmbedgridConfig) -> anyhow::Result<()> {
    info!("Embedgrid daemon starting");

    let (mesh, orchestrator) = build(&config);
    seed(&orchestrator, config.seed.sessions).await;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let health_mesh = mesh.clone();
    let health_shutdown = shutdown_rx.clone();
    let health_handle = tokio::spawn(async move {
        health_mesh.run_health_loop(health_shutdown).await;
    });

    let rotation_mesh = mesh.clone();
    let rotation_shutdown = shutdown_rx.clone();
    let rotation_handle = tokio::spawn(async move {
        rotation_mesh.run_rotation_loop(rotation_shutdown).await;
    });

    let report_interval = Duration::from_secs(config.seed.report_interval_secs.max(1));
    let report_handle = tokio::spawn(report_loop(orchestrator.clone(), report_interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = health_handle.await;
    let _ = rotation_handle.await;
    let _ = report_handle.await;

    info!("Embedgrid daemon stopped");
    Ok(())
}

async fn report_loop(orchestrator: Arc<SessionOrchestrator>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orchestrator.get_global_metrics().await {
                    Ok(metrics) => info!(
                        sessions = metrics.total_sessions,
                        desired_replicas = metrics.desired_replicas,
                        active_replicas = metrics.sessions.active_replicas,
                        error_rate = metrics.sessions.error_rate,
                        avg_latency_ms = metrics.sessions.avg_latency_ms,
                        proxy_sessions = metrics.proxy.active_sessions,
                        coverage = metrics.coverage.coverage_ratio,
                        "global metrics"
                    ),
                    Err(e) => warn!(error = %e, "global metrics unavailable"),
                }
                let grid = orchestrator.get_hypergrid_snapshot(None).await;
                info!(
                    grid_side = grid.grid_side,
                    tiles = grid.tiles.len(),
                    generated_at = grid.generated_at,
                    "hypergrid"
                );
            }
            _ = shutdown.changed() => {
                info!("metrics reporter shutting down");
                return;
            }
        }
    }
}

async fn run_snapshot(config: EmbedgridConfig, sessions: u64) -> anyhow::Result<()> {
    let (_mesh, orchestrator) = build(&config);
    seed(&orchestrator, sessions).await;
    let metrics = orchestrator.get_global_metrics().await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
