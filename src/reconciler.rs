//! Startup Reconciler (spec §4.I): runs once before any worker connects or
//! any tick fires, bringing the Store and Index back to a consistent view
//! after an unclean shutdown.
//!
//! Grounded on `knhk-sidecar`'s `main.rs` startup sequencing (health probe
//! before accepting traffic); here the equivalent "probe" is a full sweep
//! of the durable state rather than a readiness check.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::clock::{Clock, SharedClock};
use crate::error::OrchestratorResult;
use crate::index::PendingDueIndex;
use crate::model::{PlanetStatus, TaskOutcome, WorkerStatus};
use crate::store::SledStore;

pub struct StartupReconciler {
    store: Arc<SledStore>,
    index: Arc<PendingDueIndex>,
    clock: SharedClock,
}

impl StartupReconciler {
    pub fn new(store: Arc<SledStore>, index: Arc<PendingDueIndex>, clock: SharedClock) -> Self {
        Self { store, index, clock }
    }

    /// Step 1: every worker row is marked offline (no session survives a restart).
    /// Step 2: planets stuck `processing` are requeued and their open history row closed.
    /// Step 3: the index is rebuilt from scratch off the reconciled Store.
    #[instrument(skip(self))]
    pub async fn run(&self) -> OrchestratorResult<()> {
        let now = self.clock.now();

        for mut worker in self.store.list_workers()? {
            worker.status = WorkerStatus::Offline;
            worker.current_task = None;
            worker.disconnected_at = Some(now);
            self.store.put_worker(&worker)?;
        }

        let mut requeued = 0;
        for mut planet in self.store.list_planets()? {
            if planet.status == PlanetStatus::Processing {
                if let Some(server_id) = planet.processing_server_id.take() {
                    if let Some(mut row) = self.store.get_history(&planet.planet_id, &server_id)? {
                        if row.end_time.is_none() {
                            row.close(TaskOutcome::Timeout, now, Some("orchestrator restarted".to_string()));
                            self.store.put_history(&row)?;
                        }
                    }
                }
                planet.status = PlanetStatus::Queued;
                planet.next_round_time = now;
                self.store.put_planet(&planet)?;
                requeued += 1;
            }
        }

        self.index.ids().iter().for_each(|id| self.index.remove(id));
        let mut indexed = 0;
        for planet in self.store.list_planets()? {
            if planet.belongs_in_index() {
                self.index.put(&planet.planet_id, planet.next_round_time);
                indexed += 1;
            }
        }

        info!(requeued, indexed, "startup reconciliation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Planet, Worker};

    #[tokio::test]
    async fn requeues_stuck_processing_planets_and_offlines_workers() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let index = Arc::new(PendingDueIndex::new());
        let clock = ManualClock::new(chrono::Utc::now());
        let now = clock.now();

        let mut p = Planet::new("p1".into(), 1, 0, 0, now);
        p.status = PlanetStatus::Processing;
        p.processing_server_id = Some("w1".into());
        store.put_planet(&p).unwrap();

        let mut w = Worker::new_connected("w1".into(), "10.0.0.1".into(), now);
        w.status = WorkerStatus::Busy;
        w.current_task = Some("p1".into());
        store.put_worker(&w).unwrap();

        let id = store.next_history_id().unwrap();
        store
            .put_history(&crate::model::TaskHistory::start(id, "p1".into(), "w1".into(), now))
            .unwrap();

        let reconciler = StartupReconciler::new(store.clone(), index.clone(), Arc::new(clock));
        reconciler.run().await.unwrap();

        let p = store.get_planet("p1").unwrap().unwrap();
        assert_eq!(p.status, PlanetStatus::Queued);
        assert!(p.processing_server_id.is_none());
        assert!(index.contains("p1"));

        let w = store.get_worker("w1").unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Offline);
        assert!(w.current_task.is_none());

        let row = store.get_history("p1", "w1").unwrap().unwrap();
        assert_eq!(row.status, TaskOutcome::Timeout);
    }

    #[tokio::test]
    async fn rebuilds_index_from_queued_planets_only() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let index = Arc::new(PendingDueIndex::new());
        let clock = ManualClock::new(chrono::Utc::now());
        let now = clock.now();

        store.create_planet(Planet::new("queued".into(), 1, 0, 0, now)).unwrap();
        let mut errored = Planet::new("errored".into(), 1, 0, 0, now);
        errored.status = PlanetStatus::Error;
        store.create_planet(errored).unwrap();

        // Stale entry that should be dropped by the rebuild.
        index.put("ghost", now);

        let reconciler = StartupReconciler::new(store.clone(), index.clone(), Arc::new(clock));
        reconciler.run().await.unwrap();

        assert!(index.contains("queued"));
        assert!(index.contains("errored"));
        assert!(!index.contains("ghost"));
        assert_eq!(index.size(), 2);
    }
}
