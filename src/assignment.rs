//! Assignment Engine (spec §4.F): pairs due planets with idle workers.
//!
//! Triggered by a periodic tick or an internal "worker became idle" /
//! "planet became due" signal (spec §2, §4.F). Idempotent: safe to fire
//! concurrently with itself and with the Completion Handler because the
//! per-pair commit (step 4) is scoped by the shared assignment lock
//! (spec §5 ordering guarantee 3).

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::OrchestratorResult;
use crate::index::PendingDueIndex;
use crate::metrics::Metrics;
use crate::model::{PlanetStatus, TaskHistory, TaskOutcome, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::session::OutboundFrame;
use crate::store::SledStore;

pub struct AssignmentEngine {
    store: Arc<SledStore>,
    index: Arc<PendingDueIndex>,
    registry: Arc<WorkerRegistry>,
    clock: SharedClock,
    /// Shared with `CompletionHandler` (spec §5 ordering guarantee 3).
    assignment_lock: Arc<tokio::sync::Mutex<()>>,
    metrics: Arc<Metrics>,
}

impl AssignmentEngine {
    pub fn new(
        store: Arc<SledStore>,
        index: Arc<PendingDueIndex>,
        registry: Arc<WorkerRegistry>,
        clock: SharedClock,
        assignment_lock: Arc<tokio::sync::Mutex<()>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            index,
            registry,
            clock,
            assignment_lock,
            metrics,
        }
    }

    /// One pass; returns the number of planets dispatched.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> OrchestratorResult<usize> {
        let now = self.clock.now();

        let idle_workers: Vec<String> = self
            .store
            .list_workers()?
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Idle && self.registry.has_live_session(&w.server_id))
            .map(|w| w.server_id)
            .collect();

        self.metrics.idle_workers.set(idle_workers.len() as i64);
        self.metrics.queue_size.set(self.index.size() as i64);

        if idle_workers.is_empty() {
            return Ok(0);
        }

        let idle_ordered = self
            .registry
            .order_by_load(idle_workers.iter().map(String::as_str), idle_workers.len());
        let due = self.index.range_due(now, idle_ordered.len());

        let mut dispatched = 0;
        for ((planet_id, due_at), server_id) in due.into_iter().zip(idle_ordered.into_iter()) {
            if self.try_assign(&planet_id, due_at, &server_id, now).await? {
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Step 4 of §4.F: the atomic per-pair transition. Returns `false` on
    /// any abort (planet/worker left untouched, per spec).
    async fn try_assign(
        &self,
        planet_id: &str,
        expected_due: chrono::DateTime<chrono::Utc>,
        server_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> OrchestratorResult<bool> {
        let _guard = self.assignment_lock.lock().await;

        let Some(mut planet) = self.store.get_planet(planet_id)? else {
            return Ok(false);
        };
        if !matches!(planet.status, PlanetStatus::Queued | PlanetStatus::Error)
            || planet.next_round_time != expected_due
        {
            return Ok(false);
        }

        let Some(mut worker) = self.store.get_worker(server_id)? else {
            return Ok(false);
        };
        if worker.status != WorkerStatus::Idle || worker.current_task.is_some() {
            return Ok(false);
        }

        let Some(session) = self.registry.get(server_id) else {
            return Ok(false);
        };

        let frame = OutboundFrame::AssignJob {
            planet_id: planet_id.to_string(),
            season_id: planet.season_id,
            round_id: planet.round_id,
        };
        if session.try_send(frame).is_err() {
            warn!(planet_id, server_id, "outbound queue full, leaving planet queued");
            return Ok(false);
        }

        planet.status = PlanetStatus::Processing;
        planet.processing_server_id = Some(server_id.to_string());

        worker.status = WorkerStatus::Busy;
        worker.current_task = Some(planet_id.to_string());
        worker.total_assigned += 1;

        let reuse_row = self
            .store
            .get_history(planet_id, server_id)?
            .filter(|row| row.status == TaskOutcome::Failed && planet.error_retry_count > 0);
        let row = match reuse_row {
            Some(mut row) => {
                row.restart(now);
                row
            }
            None => {
                let id = self.store.next_history_id()?;
                TaskHistory::start(id, planet_id.to_string(), server_id.to_string(), now)
            }
        };

        self.index.remove(planet_id);
        self.store.put_planet(&planet)?;
        self.store.put_worker(&worker)?;
        self.store.put_history(&row)?;
        self.metrics.assignments_total.inc();

        info!(planet_id, server_id, "assigned");
        Ok(true)
    }
}
