//! Planet orchestration core: dispatch and recovery for periodic
//! planet-calculation jobs across a fleet of worker nodes connected over
//! a persistent bidirectional websocket channel.
//!
//! `Orchestrator` is the facade the binary (and the HTTP/WS adapters)
//! drive; it owns the durable Store, the in-memory Pending-Due Index and
//! Worker Registry, and the engines that move work between them.

pub mod assignment;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod health_loop;
pub mod http;
pub mod index;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod store;
pub mod ws;

use std::sync::Arc;
use tracing::{info, instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assignment::AssignmentEngine;
use clock::{SharedClock, SystemClock};
use completion::CompletionHandler;
use config::OrchestratorConfig;
use error::{OrchestratorError, OrchestratorResult};
use health_loop::HealthLoop;
use index::PendingDueIndex;
use metrics::Metrics;
use model::{Planet, PlanetStatus, Worker};
use reconciler::StartupReconciler;
use registry::WorkerRegistry;
use session::{InboundWorkerStatus, OutboundFrame, SessionHandle};
use store::SledStore;

/// Installs a JSON-structured `tracing` subscriber honoring `RUST_LOG`,
/// matching `knhk-sidecar`'s startup convention.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub struct Orchestrator {
    pub store: Arc<SledStore>,
    pub index: Arc<PendingDueIndex>,
    pub registry: Arc<WorkerRegistry>,
    pub clock: SharedClock,
    pub metrics: Arc<Metrics>,
    pub config: OrchestratorConfig,
    assignment_engine: AssignmentEngine,
    completion_handler: CompletionHandler,
    health_loop: HealthLoop,
    reconciler: StartupReconciler,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, store: SledStore) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: OrchestratorConfig, store: SledStore, clock: SharedClock) -> Self {
        let store = Arc::new(store);
        let index = Arc::new(PendingDueIndex::new());
        let registry = Arc::new(WorkerRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let assignment_lock = Arc::new(tokio::sync::Mutex::new(()));

        let assignment_engine = AssignmentEngine::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            clock.clone(),
            assignment_lock.clone(),
            metrics.clone(),
        );
        let completion_handler = CompletionHandler::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            clock.clone(),
            assignment_lock.clone(),
            metrics.clone(),
            config.retry.max_retries,
            config.retry.reset_cooldown_secs,
        );
        let health_loop = HealthLoop::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            clock.clone(),
            metrics.clone(),
            assignment_lock,
            config.health.heartbeat_stale_secs,
            config.health.heartbeat_offline_secs,
        );
        let reconciler = StartupReconciler::new(store.clone(), index.clone(), clock.clone());

        Self {
            store,
            index,
            registry,
            clock,
            metrics,
            config,
            assignment_engine,
            completion_handler,
            health_loop,
            reconciler,
        }
    }

    /// Runs once at process start, before any session or loop is active (spec §4.I).
    pub async fn reconcile_on_startup(&self) -> OrchestratorResult<()> {
        self.reconciler.run().await
    }

    /// One Assignment Engine pass (spec §4.F); returns the number dispatched.
    pub async fn run_assignment_pass(&self) -> OrchestratorResult<usize> {
        self.assignment_engine.run_once().await
    }

    /// One Health Loop tick (spec §4.H, steps 1–3); the caller triggers the
    /// Assignment Engine afterward (step 4), matching `run_assignment_pass`.
    pub async fn run_health_tick(&self) -> OrchestratorResult<()> {
        self.health_loop.tick().await
    }

    // --- §6.2 administrative operations ---------------------------------

    #[instrument(skip(self))]
    pub fn create_planet(
        &self,
        planet_id: String,
        season_id: i64,
        round_id: i64,
        current_round_number: i64,
    ) -> OrchestratorResult<Planet> {
        if !Planet::validate_id(&planet_id) {
            return Err(OrchestratorError::InvalidPlanetId(planet_id));
        }
        let now = self.clock.now();
        let planet = Planet::new(planet_id.clone(), season_id, round_id, current_round_number, now);
        self.store.create_planet(planet.clone())?;
        self.index.put(&planet_id, now);
        info!(planet_id, "planet created");
        Ok(planet)
    }

    #[instrument(skip(self))]
    pub fn remove_planet(&self, planet_id: &str) -> OrchestratorResult<()> {
        self.store.delete_planet_if_idle(planet_id)?;
        self.index.remove(planet_id);
        info!(planet_id, "planet removed");
        Ok(())
    }

    /// HTTP fallback for `job_done` (spec §6.2 `POST /result`).
    pub async fn record_result(
        &self,
        server_id: &str,
        planet_id: &str,
        next_round_time: chrono::DateTime<chrono::Utc>,
    ) -> OrchestratorResult<()> {
        self.completion_handler
            .on_job_done(server_id, planet_id, next_round_time)
            .await?;
        Ok(())
    }

    /// Nudges the Assignment Engine out of band (spec §6.2 `POST /force-assign`).
    pub async fn force_assign(&self) -> OrchestratorResult<usize> {
        self.run_assignment_pass().await
    }

    /// Sends an admin `command` frame to a connected worker (spec §6.2 `POST /command`).
    pub fn send_command(&self, server_id: &str, command: String, params: Option<serde_json::Value>) -> OrchestratorResult<()> {
        let session = self
            .registry
            .get(server_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(server_id.to_string()))?;
        session.try_send(OutboundFrame::Command { command, params })
    }

    // --- Session Layer entry points, driven by `ws.rs` ------------------

    /// A worker's websocket upgraded and registered its outbound sender (spec §4.E).
    pub fn connect_worker(&self, server_id: &str, server_ip: &str, outbound: SessionHandle) -> OrchestratorResult<()> {
        let now = self.clock.now();
        let (worker, orphaned_task) = match self.store.get_worker(server_id)? {
            Some(mut existing) => {
                let orphaned_task = existing.reconnect(now);
                (existing, orphaned_task)
            }
            None => (Worker::new_connected(server_id.to_string(), server_ip.to_string(), now), None),
        };
        if let Some(planet_id) = orphaned_task {
            self.release_reclaimed(&planet_id, server_id, now)?;
        }
        self.store.put_worker(&worker)?;
        self.registry.attach(server_id.to_string(), outbound, now);
        info!(server_id, "worker connected");
        Ok(())
    }

    fn release_reclaimed(&self, planet_id: &str, server_id: &str, now: chrono::DateTime<chrono::Utc>) -> OrchestratorResult<()> {
        if let Some(mut planet) = self.store.get_planet(planet_id)? {
            if planet.processing_server_id.as_deref() == Some(server_id) {
                planet.processing_server_id = None;
                planet.status = if planet.error_retry_count > 0 {
                    PlanetStatus::Error
                } else {
                    PlanetStatus::Queued
                };
                planet.next_round_time = now;
                self.store.put_planet(&planet)?;
                self.index.put(planet_id, now);
            }
        }
        Ok(())
    }

    /// The session's read loop closed, by any means (spec §4.E state machine).
    pub fn disconnect_worker(&self, server_id: &str) -> OrchestratorResult<()> {
        let now = self.clock.now();
        self.registry.detach(server_id);
        if let Some(mut worker) = self.store.get_worker(server_id)? {
            if let Some(planet_id) = worker.current_task.take() {
                self.release_reclaimed(&planet_id, server_id, now)?;
            }
            worker.status = model::WorkerStatus::Offline;
            worker.disconnected_at = Some(now);
            self.store.put_worker(&worker)?;
        }
        info!(server_id, "worker disconnected");
        Ok(())
    }

    pub fn record_heartbeat(
        &self,
        server_id: &str,
        idle_cpu: f64,
        max_cpu: f64,
        idle_ram: f64,
        max_ram: f64,
        disk: f64,
    ) -> OrchestratorResult<()> {
        let Some(mut worker) = self.store.get_worker(server_id)? else {
            return Err(OrchestratorError::WorkerNotFound(server_id.to_string()));
        };
        worker.last_heartbeat = self.clock.now();
        worker.idle_cpu = idle_cpu;
        worker.max_cpu = max_cpu;
        worker.idle_ram = idle_ram;
        worker.max_ram = max_ram;
        worker.disk = disk;
        self.store.put_worker(&worker)
    }

    /// Returns `true` if the status transition was to `idle` (a nudge signal
    /// for the Assignment Engine, spec §2, §4.F(b)).
    pub fn record_status_update(&self, server_id: &str, status: InboundWorkerStatus) -> OrchestratorResult<bool> {
        let Some(mut worker) = self.store.get_worker(server_id)? else {
            return Err(OrchestratorError::WorkerNotFound(server_id.to_string()));
        };
        worker.status = match status {
            InboundWorkerStatus::Idle => model::WorkerStatus::Idle,
            InboundWorkerStatus::Busy => model::WorkerStatus::Busy,
            InboundWorkerStatus::NotInitialized => model::WorkerStatus::NotInitialized,
        };
        self.store.put_worker(&worker)?;
        Ok(status == InboundWorkerStatus::Idle)
    }

    pub async fn on_job_done(
        &self,
        server_id: &str,
        planet_id: &str,
        next_round_time: chrono::DateTime<chrono::Utc>,
    ) -> OrchestratorResult<()> {
        self.completion_handler
            .on_job_done(server_id, planet_id, next_round_time)
            .await?;
        Ok(())
    }

    pub async fn on_job_skipped(
        &self,
        server_id: &str,
        planet_id: &str,
        next_round_time: chrono::DateTime<chrono::Utc>,
        reason: Option<String>,
    ) -> OrchestratorResult<()> {
        self.completion_handler
            .on_job_skipped(server_id, planet_id, next_round_time, reason)
            .await?;
        Ok(())
    }

    pub async fn on_error(&self, server_id: &str, planet_id: &str, error_message: &str) -> OrchestratorResult<()> {
        self.completion_handler.on_error(server_id, planet_id, error_message).await?;
        Ok(())
    }
}
