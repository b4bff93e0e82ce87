//! End-to-end scenarios against an in-process `Orchestrator`, one per
//! concrete scenario in the specification's testable-properties section.

use std::sync::Arc;

use chrono::{Duration, Utc};
use orchestrator_core::clock::{Clock, ManualClock};
use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::model::{PlanetStatus, WorkerStatus};
use orchestrator_core::session::{InboundWorkerStatus, OutboundFrame, SessionHandle};
use orchestrator_core::store::SledStore;
use orchestrator_core::Orchestrator;
use tokio::sync::mpsc;

fn build() -> (Orchestrator, ManualClock) {
    let store = SledStore::open_temporary().unwrap();
    let clock = ManualClock::new(Utc::now());
    let orchestrator = Orchestrator::with_clock(OrchestratorConfig::default(), store, Arc::new(clock.clone()));
    (orchestrator, clock)
}

fn attach(orchestrator: &Orchestrator, server_id: &str) -> mpsc::Receiver<OutboundFrame> {
    let (tx, rx) = mpsc::channel(32);
    orchestrator
        .connect_worker(server_id, "10.0.0.1", SessionHandle::new(tx))
        .unwrap();
    rx
}

#[tokio::test]
async fn happy_path_dispatches_and_completes() {
    let (orchestrator, clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    let mut rx = attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();

    let dispatched = orchestrator.run_assignment_pass().await.unwrap();
    assert_eq!(dispatched, 1);

    let frame = rx.try_recv().unwrap();
    assert!(matches!(frame, OutboundFrame::AssignJob { ref planet_id, season_id: 1, round_id: 0 } if planet_id == "p1"));

    let completion_time = clock.now() + Duration::minutes(1);
    orchestrator.on_job_done("w1", "p1", completion_time).await.unwrap();

    let worker = orchestrator.store.get_worker("w1").unwrap().unwrap();
    assert_eq!(worker.total_completed, 1);
    let planet = orchestrator.store.get_planet("p1").unwrap().unwrap();
    assert_eq!(planet.current_round_number, 1);
    assert_eq!(planet.status, PlanetStatus::Queued);
    assert!(orchestrator.index.contains("p1"));
}

#[tokio::test]
async fn race_on_idle_assigns_exactly_one_planet() {
    let (orchestrator, _clock) = build();
    orchestrator.create_planet("pA".into(), 1, 0, 0).unwrap();
    orchestrator.create_planet("pB".into(), 1, 0, 0).unwrap();
    attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();

    let dispatched = orchestrator.run_assignment_pass().await.unwrap();
    assert_eq!(dispatched, 1);

    let statuses: Vec<_> = ["pA", "pB"]
        .iter()
        .map(|id| orchestrator.store.get_planet(id).unwrap().unwrap().status)
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == PlanetStatus::Processing).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == PlanetStatus::Queued).count(), 1);

    let worker = orchestrator.store.get_worker("w1").unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
}

#[tokio::test]
async fn worker_crash_mid_job_is_reclaimed_after_sixty_seconds() {
    let (orchestrator, clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();
    orchestrator.run_assignment_pass().await.unwrap();

    // The channel drops without a clean disconnect frame; heartbeats cease.
    clock.advance(Duration::seconds(61));
    orchestrator.run_health_tick().await.unwrap();

    let worker = orchestrator.store.get_worker("w1").unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);

    let planet = orchestrator.store.get_planet("p1").unwrap().unwrap();
    assert_eq!(planet.status, PlanetStatus::Queued);
    assert!(planet.processing_server_id.is_none());
    assert!(orchestrator.index.contains("p1"));
    assert!(planet.next_round_time <= clock.now());
}

#[tokio::test]
async fn error_with_backoff_follows_powers_of_two_then_resets() {
    let (orchestrator, clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();

    let expected = [1i64, 2, 4, 8, 16];
    for &expected_offset in &expected {
        orchestrator.run_assignment_pass().await.unwrap();
        let t0 = clock.now();
        orchestrator.on_error("w1", "p1", "boom").await.unwrap();
        let planet = orchestrator.store.get_planet("p1").unwrap().unwrap();
        assert_eq!((planet.next_round_time - t0).num_seconds(), expected_offset);
        clock.set(planet.next_round_time);
        orchestrator
            .record_status_update("w1", InboundWorkerStatus::Idle)
            .unwrap();
    }

    // Sixth failure: retry budget resets and the planet cools down for 30s.
    orchestrator.run_assignment_pass().await.unwrap();
    let t0 = clock.now();
    orchestrator.on_error("w1", "p1", "boom").await.unwrap();
    let planet = orchestrator.store.get_planet("p1").unwrap().unwrap();
    assert_eq!(planet.error_retry_count, 0);
    assert_eq!((planet.next_round_time - t0).num_seconds(), 30);
}

#[tokio::test]
async fn duplicate_create_is_rejected_with_single_index_entry() {
    let (orchestrator, _clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    let err = orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap_err();
    assert!(matches!(err, orchestrator_core::error::OrchestratorError::DuplicatePlanet(_)));
    assert_eq!(orchestrator.index.size(), 1);
}

#[tokio::test]
async fn reconnect_while_busy_reclaims_the_in_flight_planet() {
    let (orchestrator, _clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();
    orchestrator.run_assignment_pass().await.unwrap();

    let worker = orchestrator.store.get_worker("w1").unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task.as_deref(), Some("p1"));

    // The session drops and the same worker re-attaches before the Health
    // Loop would ever mark it offline.
    attach(&orchestrator, "w1");

    let planet = orchestrator.store.get_planet("p1").unwrap().unwrap();
    assert_eq!(planet.status, PlanetStatus::Queued);
    assert!(planet.processing_server_id.is_none());
    assert!(orchestrator.index.contains("p1"));

    let worker = orchestrator.store.get_worker("w1").unwrap().unwrap();
    assert!(worker.current_task.is_none());
}

#[tokio::test]
async fn delete_during_processing_then_after_completion() {
    let (orchestrator, clock) = build();
    orchestrator.create_planet("p1".into(), 1, 0, 0).unwrap();
    attach(&orchestrator, "w1");
    orchestrator
        .record_status_update("w1", InboundWorkerStatus::Idle)
        .unwrap();
    orchestrator.run_assignment_pass().await.unwrap();

    let err = orchestrator.remove_planet("p1").unwrap_err();
    assert!(matches!(err, orchestrator_core::error::OrchestratorError::PlanetBusy(_)));

    let next = clock.now() + Duration::minutes(1);
    orchestrator.on_job_done("w1", "p1", next).await.unwrap();
    orchestrator.remove_planet("p1").unwrap();
    assert!(orchestrator.store.get_planet("p1").unwrap().is_none());
    assert!(!orchestrator.index.contains("p1"));
}
