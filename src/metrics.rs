//! Prometheus series for the orchestration core (spec §9.5 of the
//! expanded specification).
//!
//! Adapted from `knhk-sidecar`'s `MetricsCollector`: that type hand-rolls
//! counters and a latency ring buffer behind `std::sync::Mutex`. Here the
//! series are domain counters (assignments, completions, failures,
//! timeouts) plus two gauges, so they map directly onto `prometheus`'s
//! own atomic types and a `Registry` that `http.rs` renders at `GET
//! /metrics` — no hand-rolled locking needed.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{OrchestratorError, OrchestratorResult};

pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounter,
    pub completions_total: IntCounter,
    pub failures_total: IntCounter,
    pub timeouts_total: IntCounter,
    pub queue_size: IntGauge,
    pub idle_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total =
            IntCounter::new("orchestrator_assignments_total", "Planets dispatched to a worker").unwrap();
        let completions_total =
            IntCounter::new("orchestrator_completions_total", "Planets completed successfully").unwrap();
        let failures_total =
            IntCounter::new("orchestrator_failures_total", "Planets that errored out of a run").unwrap();
        let timeouts_total = IntCounter::new(
            "orchestrator_timeouts_total",
            "Planets reclaimed from an unresponsive worker",
        )
        .unwrap();
        let queue_size = IntGauge::new("orchestrator_queue_size", "Planets currently due or overdue").unwrap();
        let idle_workers = IntGauge::new("orchestrator_idle_workers", "Workers currently idle").unwrap();

        registry.register(Box::new(assignments_total.clone())).unwrap();
        registry.register(Box::new(completions_total.clone())).unwrap();
        registry.register(Box::new(failures_total.clone())).unwrap();
        registry.register(Box::new(timeouts_total.clone())).unwrap();
        registry.register(Box::new(queue_size.clone())).unwrap();
        registry.register(Box::new(idle_workers.clone())).unwrap();

        Self {
            registry,
            assignments_total,
            completions_total,
            failures_total,
            timeouts_total,
            queue_size,
            idle_workers,
        }
    }

    /// Renders the current snapshot in Prometheus text exposition format.
    pub fn render(&self) -> OrchestratorResult<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| OrchestratorError::Internal(e.to_string()))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
