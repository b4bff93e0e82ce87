//! Administrative HTTP adapter (spec §6.2): a thin `axum` JSON surface
//! over the core's public `Orchestrator` operations, plus the ambient
//! `/metrics` endpoint (spec §9.5 of the expanded specification).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::{Planet, Worker};
use crate::Orchestrator;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/planet/create", post(create_planet))
        .route("/planet/remove/:planet_id", delete(remove_planet))
        .route("/result", post(record_result))
        .route("/force-assign", post(force_assign))
        .route("/command", post(send_command))
        .route("/queue", get(queue_snapshot))
        .route("/server/:server_id", get(server_snapshot))
        .route("/servers", get(servers_snapshot))
        .route("/metrics", get(metrics_snapshot))
        .with_state(orchestrator)
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::PlanetNotFound(_) | OrchestratorError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::DuplicatePlanet(_) | OrchestratorError::PlanetBusy(_) => StatusCode::CONFLICT,
            OrchestratorError::InvalidPlanetId(_) | OrchestratorError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct CreatePlanetRequest {
    #[serde(alias = "map_id")]
    planet_id: String,
    season_id: i64,
    #[serde(default)]
    round_id: i64,
    #[serde(default)]
    current_round_number: i64,
}

async fn create_planet(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<CreatePlanetRequest>,
) -> Result<(StatusCode, Json<Planet>), OrchestratorError> {
    let planet = orchestrator.create_planet(req.planet_id, req.season_id, req.round_id, req.current_round_number)?;
    Ok((StatusCode::CREATED, Json(planet)))
}

async fn remove_planet(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(planet_id): Path<String>,
) -> Result<StatusCode, OrchestratorError> {
    orchestrator.remove_planet(&planet_id)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ResultRequest {
    planet_id: String,
    server_id: String,
    next_round_time: DateTime<Utc>,
}

async fn record_result(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<ResultRequest>,
) -> Result<StatusCode, OrchestratorError> {
    orchestrator
        .record_result(&req.server_id, &req.planet_id, req.next_round_time)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize)]
struct ForceAssignResponse {
    dispatched: usize,
}

async fn force_assign(State(orchestrator): State<Arc<Orchestrator>>) -> Result<Json<ForceAssignResponse>, OrchestratorError> {
    let dispatched = orchestrator.force_assign().await?;
    Ok(Json(ForceAssignResponse { dispatched }))
}

#[derive(Deserialize)]
struct CommandRequest {
    server_id: String,
    action: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

async fn send_command(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<CommandRequest>,
) -> Result<StatusCode, OrchestratorError> {
    orchestrator.send_command(&req.server_id, req.action, req.payload)?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct QueueSnapshot {
    queue_size: usize,
    next_due_time: Option<DateTime<Utc>>,
    idle_servers: usize,
    busy_servers: usize,
    offline_servers: usize,
    queued_planets: usize,
    processing_planets: usize,
}

async fn queue_snapshot(State(orchestrator): State<Arc<Orchestrator>>) -> Result<Json<QueueSnapshot>, OrchestratorError> {
    use crate::model::{PlanetStatus, WorkerStatus};

    let planets = orchestrator.store.list_planets()?;
    let workers = orchestrator.store.list_workers()?;
    let next_due_time = orchestrator.index.peek_next().map(|(_, due)| due);

    Ok(Json(QueueSnapshot {
        queue_size: orchestrator.index.size(),
        next_due_time,
        idle_servers: workers.iter().filter(|w| w.status == WorkerStatus::Idle).count(),
        busy_servers: workers.iter().filter(|w| w.status == WorkerStatus::Busy).count(),
        offline_servers: workers.iter().filter(|w| w.status == WorkerStatus::Offline).count(),
        queued_planets: planets.iter().filter(|p| p.status == PlanetStatus::Queued).count(),
        processing_planets: planets.iter().filter(|p| p.status == PlanetStatus::Processing).count(),
    }))
}

async fn server_snapshot(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(server_id): Path<String>,
) -> Result<Json<Worker>, OrchestratorError> {
    orchestrator
        .store
        .get_worker(&server_id)?
        .map(Json)
        .ok_or_else(|| OrchestratorError::WorkerNotFound(server_id))
}

async fn servers_snapshot(State(orchestrator): State<Arc<Orchestrator>>) -> Result<Json<Vec<Worker>>, OrchestratorError> {
    Ok(Json(orchestrator.store.list_workers()?))
}

async fn metrics_snapshot(State(orchestrator): State<Arc<Orchestrator>>) -> Result<String, OrchestratorError> {
    orchestrator.metrics.render()
}
