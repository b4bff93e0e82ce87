//! Health Loop (spec §4.H): stale-heartbeat detection, orphan release,
//! index drift reconciliation.
//!
//! Adapted from `knhk-sidecar`'s `HealthChecker` (`health.rs`): that type
//! tracks named components and a liveness/readiness view; here the
//! "components" are workers and the check is heartbeat staleness rather
//! than a registered health probe, but the two-tier status model
//! (healthy/degraded/unhealthy there, idle/not_responding/offline here)
//! is the same shape.
//!
//! Orphan release shares the assignment lock with `AssignmentEngine`/
//! `CompletionHandler` (spec §5 ordering guarantee 3): without it, a
//! completion racing a stale-worker sweep for the same planet could have
//! its `next_round_time` clobbered by the sweep.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::OrchestratorResult;
use crate::index::PendingDueIndex;
use crate::metrics::Metrics;
use crate::model::{PlanetStatus, TaskOutcome, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::store::SledStore;

pub struct HealthLoop {
    store: Arc<SledStore>,
    index: Arc<PendingDueIndex>,
    registry: Arc<WorkerRegistry>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
    /// Shared with `AssignmentEngine`/`CompletionHandler` (spec §5 ordering
    /// guarantee 3): orphan release races a concurrent completion for the
    /// same planet without it.
    assignment_lock: Arc<tokio::sync::Mutex<()>>,
    stale_secs: i64,
    offline_secs: i64,
}

impl HealthLoop {
    pub fn new(
        store: Arc<SledStore>,
        index: Arc<PendingDueIndex>,
        registry: Arc<WorkerRegistry>,
        clock: SharedClock,
        metrics: Arc<Metrics>,
        assignment_lock: Arc<tokio::sync::Mutex<()>>,
        stale_secs: i64,
        offline_secs: i64,
    ) -> Self {
        Self {
            store,
            index,
            registry,
            clock,
            metrics,
            assignment_lock,
            stale_secs,
            offline_secs,
        }
    }

    /// One tick: steps 1–3 of spec §4.H (step 4, triggering the Assignment
    /// Engine, is the caller's responsibility — see `lib.rs`'s run loop).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> OrchestratorResult<()> {
        let now = self.clock.now();
        {
            let _guard = self.assignment_lock.lock().await;
            self.reconcile_worker_heartbeats(now)?;
            self.release_orphaned_planets(now)?;
        }
        self.reconcile_index_drift()?;
        Ok(())
    }

    /// Step 1: stale/offline workers, with in-flight planet release.
    fn reconcile_worker_heartbeats(&self, now: chrono::DateTime<chrono::Utc>) -> OrchestratorResult<()> {
        for mut worker in self.store.list_workers()? {
            if !self.registry.has_live_session(&worker.server_id) {
                continue;
            }
            let silence = (now - worker.last_heartbeat).num_seconds();
            if silence >= self.offline_secs {
                warn!(server_id = %worker.server_id, silence, "worker offline, releasing in-flight task");
                if let Some(planet_id) = worker.current_task.take() {
                    self.release_orphan(&planet_id, &worker.server_id, now)?;
                }
                worker.status = WorkerStatus::Offline;
                worker.disconnected_at = Some(now);
                self.registry.detach(&worker.server_id);
                self.store.put_worker(&worker)?;
            } else if silence >= self.stale_secs && worker.status != WorkerStatus::NotResponding {
                info!(server_id = %worker.server_id, silence, "worker not responding");
                worker.status = WorkerStatus::NotResponding;
                self.store.put_worker(&worker)?;
            }
        }
        Ok(())
    }

    /// Step 2: planets stuck `processing` whose worker has been unreachable too long.
    fn release_orphaned_planets(&self, now: chrono::DateTime<chrono::Utc>) -> OrchestratorResult<()> {
        for planet in self.store.list_planets()? {
            if planet.status != PlanetStatus::Processing {
                continue;
            }
            let Some(server_id) = planet.processing_server_id.clone() else {
                continue;
            };
            let orphaned = match self.store.get_worker(&server_id)? {
                None => true,
                Some(w) => {
                    matches!(w.status, WorkerStatus::Offline | WorkerStatus::NotResponding)
                        && (now - w.last_heartbeat).num_seconds() > self.offline_secs
                }
            };
            if orphaned {
                self.release_orphan(&planet.planet_id, &server_id, now)?;
                if let Some(mut w) = self.store.get_worker(&server_id)? {
                    w.total_failed += 1;
                    self.store.put_worker(&w)?;
                }
            }
        }
        Ok(())
    }

    /// Common orphan-release path (used by both steps 1 and 2): the planet
    /// returns to `queued` or `error` (if it had retries), re-indexed now,
    /// and its history row is marked `timeout`.
    fn release_orphan(&self, planet_id: &str, server_id: &str, now: chrono::DateTime<chrono::Utc>) -> OrchestratorResult<()> {
        let Some(mut planet) = self.store.get_planet(planet_id)? else {
            return Ok(());
        };
        if planet.processing_server_id.as_deref() != Some(server_id) {
            return Ok(());
        }

        planet.processing_server_id = None;
        planet.status = if planet.error_retry_count > 0 {
            PlanetStatus::Error
        } else {
            PlanetStatus::Queued
        };
        planet.next_round_time = now;
        self.store.put_planet(&planet)?;
        self.index.put(planet_id, now);

        if let Some(mut row) = self.store.get_history(planet_id, server_id)? {
            if row.end_time.is_none() {
                row.close(TaskOutcome::Timeout, now, Some("worker unreachable".to_string()));
                self.store.put_history(&row)?;
            }
        }
        self.metrics.timeouts_total.inc();
        warn!(planet_id, server_id, "orphaned planet released");
        Ok(())
    }

    /// Step 3: repair drift between the Store and the Index (spec §3 P3).
    fn reconcile_index_drift(&self) -> OrchestratorResult<()> {
        let planets = self.store.list_planets()?;
        let eligible: std::collections::HashSet<String> = planets
            .iter()
            .filter(|p| p.belongs_in_index())
            .map(|p| p.planet_id.clone())
            .collect();

        for planet in &planets {
            if planet.belongs_in_index() && !self.index.contains(&planet.planet_id) {
                self.index.put(&planet.planet_id, planet.next_round_time);
            }
        }
        for id in self.index.ids() {
            if !eligible.contains(&id) {
                self.index.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Planet, Worker};
    use crate::session::SessionHandle;
    use tokio::sync::mpsc;

    fn harness() -> (HealthLoop, Arc<SledStore>, Arc<PendingDueIndex>, Arc<WorkerRegistry>, ManualClock) {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let index = Arc::new(PendingDueIndex::new());
        let registry = Arc::new(WorkerRegistry::new());
        let clock = ManualClock::new(chrono::Utc::now());
        let metrics = Arc::new(Metrics::new());
        let assignment_lock = Arc::new(tokio::sync::Mutex::new(()));
        let health = HealthLoop::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            Arc::new(clock.clone()),
            metrics,
            assignment_lock,
            30,
            60,
        );
        (health, store, index, registry, clock)
    }

    #[tokio::test]
    async fn worker_crash_mid_job_releases_planet_after_offline_threshold() {
        let (health, store, index, registry, clock) = harness();
        let now = clock.now();

        let mut p = Planet::new("p1".into(), 1, 0, 0, now);
        p.status = PlanetStatus::Processing;
        p.processing_server_id = Some("w1".into());
        store.put_planet(&p).unwrap();

        let mut w = Worker::new_connected("w1".into(), "10.0.0.1".into(), now);
        w.status = WorkerStatus::Busy;
        w.current_task = Some("p1".into());
        store.put_worker(&w).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.attach("w1".into(), SessionHandle::new(tx), now);

        let id = store.next_history_id().unwrap();
        store
            .put_history(&crate::model::TaskHistory::start(id, "p1".into(), "w1".into(), now))
            .unwrap();

        clock.advance(chrono::Duration::seconds(61));
        health.tick().await.unwrap();

        let w = store.get_worker("w1").unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Offline);
        assert!(!registry.has_live_session("w1"));

        let p = store.get_planet("p1").unwrap().unwrap();
        assert_eq!(p.status, PlanetStatus::Queued);
        assert!(p.processing_server_id.is_none());
        assert!(index.contains("p1"));

        let row = store.get_history("p1", "w1").unwrap().unwrap();
        assert_eq!(row.status, TaskOutcome::Timeout);
    }

    #[tokio::test]
    async fn moderate_silence_marks_not_responding_without_releasing_task() {
        let (health, store, _index, registry, clock) = harness();
        let now = clock.now();
        let mut w = Worker::new_connected("w1".into(), "10.0.0.1".into(), now);
        w.status = WorkerStatus::Busy;
        store.put_worker(&w).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.attach("w1".into(), SessionHandle::new(tx), now);

        clock.advance(chrono::Duration::seconds(31));
        health.tick().await.unwrap();

        let w = store.get_worker("w1").unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::NotResponding);
        assert!(registry.has_live_session("w1"));
    }

    #[tokio::test]
    async fn drift_reconcile_reinserts_missing_queued_planet() {
        let (health, store, index, _registry, clock) = harness();
        let now = clock.now();
        store.create_planet(Planet::new("p1".into(), 1, 0, 0, now)).unwrap();
        assert!(!index.contains("p1"));

        health.tick().await.unwrap();
        assert!(index.contains("p1"));
    }

    #[tokio::test]
    async fn drift_reconcile_removes_ineligible_index_entry() {
        let (health, store, index, _registry, clock) = harness();
        let now = clock.now();
        let mut p = Planet::new("p1".into(), 1, 0, 0, now);
        p.status = PlanetStatus::Processing;
        p.processing_server_id = Some("w1".into());
        store.put_planet(&p).unwrap();
        index.put("p1", now);

        health.tick().await.unwrap();
        assert!(!index.contains("p1"));
    }
}
