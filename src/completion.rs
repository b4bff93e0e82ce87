//! Completion Handler (spec §4.G): processes job_done / job_skipped / error
//! and re-queues. Shares the assignment lock with `AssignmentEngine` so a
//! completion for planet P is atomic with respect to any concurrent
//! assignment attempt for P (spec §5 ordering guarantee 3).

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::OrchestratorResult;
use crate::index::PendingDueIndex;
use crate::metrics::Metrics;
use crate::model::{PlanetStatus, TaskOutcome, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::store::SledStore;

pub struct CompletionHandler {
    store: Arc<SledStore>,
    index: Arc<PendingDueIndex>,
    registry: Arc<WorkerRegistry>,
    clock: SharedClock,
    assignment_lock: Arc<tokio::sync::Mutex<()>>,
    metrics: Arc<Metrics>,
    /// Retry budget before cooldown reset (spec §4.G / §8 I4), from config.
    max_retries: u32,
    /// Cooldown applied once the retry budget resets, seconds (spec §4.G), from config.
    reset_cooldown_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionResult {
    Applied,
    /// Stale completion for a reassigned/deleted planet: logged and dropped (spec §4.G, §7).
    Stale,
}

impl CompletionHandler {
    pub fn new(
        store: Arc<SledStore>,
        index: Arc<PendingDueIndex>,
        registry: Arc<WorkerRegistry>,
        clock: SharedClock,
        assignment_lock: Arc<tokio::sync::Mutex<()>>,
        metrics: Arc<Metrics>,
        max_retries: u32,
        reset_cooldown_secs: i64,
    ) -> Self {
        Self {
            store,
            index,
            registry,
            clock,
            assignment_lock,
            metrics,
            max_retries,
            reset_cooldown_secs,
        }
    }

    /// Backoff schedule for the nth failure (1-indexed): 1, 2, 4, 8, 16 seconds.
    pub fn backoff_seconds(retry_count: u32) -> i64 {
        1i64 << (retry_count.saturating_sub(1).min(4))
    }

    #[instrument(skip(self))]
    pub async fn on_job_done(
        &self,
        server_id: &str,
        planet_id: &str,
        next_round_time: chrono::DateTime<chrono::Utc>,
    ) -> OrchestratorResult<CompletionResult> {
        let _guard = self.assignment_lock.lock().await;
        let now = self.clock.now();

        let Some(mut planet) = self.store.get_planet(planet_id)? else {
            warn!(planet_id, server_id, "job_done for unknown planet, dropped");
            return Ok(CompletionResult::Stale);
        };
        if planet.processing_server_id.as_deref() != Some(server_id) {
            warn!(planet_id, server_id, "stale job_done, processing_server_id mismatch");
            return Ok(CompletionResult::Stale);
        }
        let Some(mut worker) = self.store.get_worker(server_id)? else {
            warn!(server_id, "job_done from unknown worker, dropped");
            return Ok(CompletionResult::Stale);
        };

        planet.current_round_number += 1;
        planet.round_id += 1;
        planet.next_round_time = next_round_time;
        planet.status = PlanetStatus::Queued;
        planet.processing_server_id = None;
        planet.last_processed = Some(now);
        planet.error_retry_count = 0;

        worker.status = WorkerStatus::Idle;
        worker.current_task = None;
        worker.total_completed += 1;

        if let Some(mut row) = self.store.get_history(planet_id, server_id)? {
            let dur = (now - row.start_time).num_milliseconds() as f64 / 1000.0;
            row.close(TaskOutcome::Completed, now, None);
            row.duration_seconds = Some(dur);
            self.store.put_history(&row)?;
        }

        self.index.put(planet_id, next_round_time);
        self.store.put_planet(&planet)?;
        self.store.put_worker(&worker)?;
        self.registry.record_completed(server_id, worker.total_completed);
        self.metrics.completions_total.inc();

        info!(planet_id, server_id, "job done, requeued");
        Ok(CompletionResult::Applied)
    }

    #[instrument(skip(self))]
    pub async fn on_job_skipped(
        &self,
        server_id: &str,
        planet_id: &str,
        next_round_time: chrono::DateTime<chrono::Utc>,
        reason: Option<String>,
    ) -> OrchestratorResult<CompletionResult> {
        let _guard = self.assignment_lock.lock().await;
        let now = self.clock.now();

        let Some(mut planet) = self.store.get_planet(planet_id)? else {
            return Ok(CompletionResult::Stale);
        };
        if planet.processing_server_id.as_deref() != Some(server_id) {
            warn!(planet_id, server_id, "stale job_skipped, dropped");
            return Ok(CompletionResult::Stale);
        }
        let Some(mut worker) = self.store.get_worker(server_id)? else {
            return Ok(CompletionResult::Stale);
        };

        planet.status = PlanetStatus::Queued;
        planet.processing_server_id = None;
        planet.next_round_time = next_round_time;

        // No completion credit on skip (spec §4.G).
        worker.status = WorkerStatus::Idle;
        worker.current_task = None;

        if let Some(mut row) = self.store.get_history(planet_id, server_id)? {
            // Open Question (c): marked completed with an explanatory message, per spec §9(c).
            let message = format!("skipped: {}", reason.as_deref().unwrap_or("no reason given"));
            row.close(TaskOutcome::Completed, now, Some(message));
            self.store.put_history(&row)?;
        }

        self.index.put(planet_id, next_round_time);
        self.store.put_planet(&planet)?;
        self.store.put_worker(&worker)?;

        info!(planet_id, server_id, "job skipped, requeued");
        Ok(CompletionResult::Applied)
    }

    #[instrument(skip(self))]
    pub async fn on_error(
        &self,
        server_id: &str,
        planet_id: &str,
        error_message: &str,
    ) -> OrchestratorResult<CompletionResult> {
        let _guard = self.assignment_lock.lock().await;
        let now = self.clock.now();

        let Some(mut planet) = self.store.get_planet(planet_id)? else {
            return Ok(CompletionResult::Stale);
        };
        if planet.processing_server_id.as_deref() != Some(server_id) {
            warn!(planet_id, server_id, "stale error report, dropped");
            return Ok(CompletionResult::Stale);
        }
        let Some(mut worker) = self.store.get_worker(server_id)? else {
            return Ok(CompletionResult::Stale);
        };

        worker.status = WorkerStatus::Idle;
        worker.current_task = None;
        worker.total_failed += 1;

        planet.error_retry_count += 1;
        planet.processing_server_id = None;
        let new_due = if planet.error_retry_count <= self.max_retries {
            let backoff = chrono::Duration::seconds(Self::backoff_seconds(planet.error_retry_count));
            std::cmp::max(now + backoff, planet.next_round_time)
        } else {
            planet.error_retry_count = 0;
            now + chrono::Duration::seconds(self.reset_cooldown_secs)
        };
        planet.status = PlanetStatus::Error;
        planet.next_round_time = new_due;

        if let Some(mut row) = self.store.get_history(planet_id, server_id)? {
            row.close(TaskOutcome::Failed, now, Some(error_message.to_string()));
            self.store.put_history(&row)?;
        }

        self.index.put(planet_id, new_due);
        self.store.put_planet(&planet)?;
        self.store.put_worker(&worker)?;
        self.metrics.failures_total.inc();

        warn!(planet_id, server_id, error_message, "job error, backed off");
        Ok(CompletionResult::Applied)
    }
}
