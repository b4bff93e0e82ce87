//! `orchestratord`: binary entry point for the planet orchestration core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::store::SledStore;
use orchestrator_core::{http, init_tracing, ws, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "orchestratord", about = "Planet orchestration core")]
struct Cli {
    /// Path to a TOML config file; falls back to `ORCHESTRATOR_CONFIG` then defaults.
    #[arg(long, env = "ORCHESTRATOR_CONFIG_FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => OrchestratorConfig::from_file(&path)?,
        None => OrchestratorConfig::from_env_or_default()?,
    };
    let bind_address: SocketAddr = config.server.bind_address.parse()?;

    let store = SledStore::open(&config.store.sled_path)?;
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), store));

    orchestrator.reconcile_on_startup().await?;
    info!("startup reconciliation complete");

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    let assignment_task = spawn_assignment_loop(orchestrator.clone(), config.health.tick_interval_secs, shutdown_tx.subscribe());
    let health_task = spawn_health_loop(orchestrator.clone(), config.health.tick_interval_secs, shutdown_tx.subscribe());

    let ws_router = axum::Router::new()
        .route("/ws/server/:server_id", axum::routing::get(ws::upgrade))
        .with_state(orchestrator.clone());
    // No auth: spec.md §1 leaves authentication/authorization explicitly open.
    let app = ws_router
        .merge(http::router(orchestrator.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(%bind_address, "listening");
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!(%err, "server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    assignment_task.abort();
    health_task.abort();

    Ok(())
}

fn spawn_assignment_loop(
    orchestrator: Arc<Orchestrator>,
    tick_interval_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = orchestrator.run_assignment_pass().await {
                        error!(%err, "assignment pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_health_loop(
    orchestrator: Arc<Orchestrator>,
    tick_interval_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = orchestrator.run_health_tick().await {
                        error!(%err, "health tick failed");
                        continue;
                    }
                    if let Err(err) = orchestrator.run_assignment_pass().await {
                        error!(%err, "post-health assignment pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
