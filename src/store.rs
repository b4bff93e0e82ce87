//! Durable Store (spec §4.B, §6.3): sled-backed persistence for planets,
//! workers, and task-history rows.
//!
//! sled was the teacher's own choice over rocksdb for this exact reason
//! (its root `Cargo.toml` comment: "Using sled as alternative for
//! persistence layer"). Each entity type gets its own `sled::Tree`; rows
//! are JSON-encoded (`serde_json`) for readability during development,
//! matching the teacher's preference for JSON wire/storage formats
//! throughout `knhk-sidecar`.

use parking_lot::Mutex;
use std::path::Path;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Planet, TaskHistory, Worker};

pub struct SledStore {
    db: sled::Db,
    planets: sled::Tree,
    workers: sled::Tree,
    history: sled::Tree,
    history_ids: sled::Tree,
    /// Serializes the compound create/delete checks below; the Assignment
    /// Engine and Completion Handler use their own finer-grained locks
    /// (spec §5) for the dispatch/completion critical sections.
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            planets: db.open_tree("planets")?,
            workers: db.open_tree("workers")?,
            history: db.open_tree("history")?,
            history_ids: db.open_tree("history_ids")?,
            write_lock: Mutex::new(()),
            db,
        })
    }

    pub fn open_temporary() -> OrchestratorResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            planets: db.open_tree("planets")?,
            workers: db.open_tree("workers")?,
            history: db.open_tree("history")?,
            history_ids: db.open_tree("history_ids")?,
            write_lock: Mutex::new(()),
            db,
        })
    }

    // --- Planets -----------------------------------------------------

    pub fn get_planet(&self, planet_id: &str) -> OrchestratorResult<Option<Planet>> {
        Ok(self
            .planets
            .get(planet_id)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?)
    }

    pub fn put_planet(&self, planet: &Planet) -> OrchestratorResult<()> {
        let bytes = serde_json::to_vec(planet)?;
        self.planets.insert(&planet.planet_id, bytes)?;
        Ok(())
    }

    /// Atomically inserts only if absent (HTTP §6.2 `POST /planet/create`, 409 on duplicate).
    pub fn create_planet(&self, planet: Planet) -> OrchestratorResult<()> {
        let _guard = self.write_lock.lock();
        if self.planets.contains_key(&planet.planet_id)? {
            return Err(OrchestratorError::DuplicatePlanet(planet.planet_id));
        }
        self.put_planet(&planet)
    }

    /// Atomically removes only if not processing (§6.2 `DELETE /planet/remove`, 409 while processing).
    pub fn delete_planet_if_idle(&self, planet_id: &str) -> OrchestratorResult<()> {
        let _guard = self.write_lock.lock();
        match self.get_planet(planet_id)? {
            None => Err(OrchestratorError::PlanetNotFound(planet_id.to_string())),
            Some(p) if p.status == crate::model::PlanetStatus::Processing => {
                Err(OrchestratorError::PlanetBusy(planet_id.to_string()))
            }
            Some(_) => {
                self.planets.remove(planet_id)?;
                Ok(())
            }
        }
    }

    pub fn list_planets(&self) -> OrchestratorResult<Vec<Planet>> {
        self.planets
            .iter()
            .values()
            .map(|v| -> OrchestratorResult<Planet> { Ok(serde_json::from_slice(&v?)?) })
            .collect()
    }

    // --- Workers -------------------------------------------------------

    pub fn get_worker(&self, server_id: &str) -> OrchestratorResult<Option<Worker>> {
        Ok(self
            .workers
            .get(server_id)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?)
    }

    pub fn put_worker(&self, worker: &Worker) -> OrchestratorResult<()> {
        let bytes = serde_json::to_vec(worker)?;
        self.workers.insert(&worker.server_id, bytes)?;
        Ok(())
    }

    pub fn list_workers(&self) -> OrchestratorResult<Vec<Worker>> {
        self.workers
            .iter()
            .values()
            .map(|v| -> OrchestratorResult<Worker> { Ok(serde_json::from_slice(&v?)?) })
            .collect()
    }

    // --- Task history ----------------------------------------------------

    fn history_key(planet_id: &str, server_id: &str) -> String {
        format!("{planet_id}::{server_id}")
    }

    pub fn next_history_id(&self) -> OrchestratorResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// H1: one row per (planet, worker) attempt-chain; retries update it in place.
    pub fn get_history(&self, planet_id: &str, server_id: &str) -> OrchestratorResult<Option<TaskHistory>> {
        Ok(self
            .history
            .get(Self::history_key(planet_id, server_id))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?)
    }

    pub fn put_history(&self, row: &TaskHistory) -> OrchestratorResult<()> {
        let key = Self::history_key(&row.planet_id, &row.server_id);
        let bytes = serde_json::to_vec(row)?;
        self.history.insert(key, bytes)?;
        Ok(())
    }

    pub fn list_history(&self) -> OrchestratorResult<Vec<TaskHistory>> {
        self.history
            .iter()
            .values()
            .map(|v| -> OrchestratorResult<TaskHistory> { Ok(serde_json::from_slice(&v?)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanetStatus;
    use chrono::Utc;

    fn sample_planet(id: &str) -> Planet {
        Planet::new(id.to_string(), 1, 0, 0, Utc::now())
    }

    #[test]
    fn create_planet_rejects_duplicates() {
        let store = SledStore::open_temporary().unwrap();
        store.create_planet(sample_planet("p1")).unwrap();
        let err = store.create_planet(sample_planet("p1")).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicatePlanet(_)));
    }

    #[test]
    fn delete_while_processing_is_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let mut p = sample_planet("p1");
        p.status = PlanetStatus::Processing;
        p.processing_server_id = Some("w1".into());
        store.put_planet(&p).unwrap();

        let err = store.delete_planet_if_idle("p1").unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanetBusy(_)));

        let mut queued = p.clone();
        queued.status = PlanetStatus::Queued;
        queued.processing_server_id = None;
        store.put_planet(&queued).unwrap();
        store.delete_planet_if_idle("p1").unwrap();
        assert!(store.get_planet("p1").unwrap().is_none());
    }

    #[test]
    fn history_row_round_trips() {
        let store = SledStore::open_temporary().unwrap();
        let id = store.next_history_id().unwrap();
        let row = TaskHistory::start(id, "p1".into(), "w1".into(), Utc::now());
        store.put_history(&row).unwrap();
        let fetched = store.get_history("p1", "w1").unwrap().unwrap();
        assert_eq!(fetched.id, id);
    }
}
