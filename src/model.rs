//! Core data model: Planet, Worker, TaskHistory (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of periodic work identified by a stable string id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planet {
    pub planet_id: String,
    pub season_id: i64,
    #[serde(default)]
    pub round_id: i64,
    #[serde(default)]
    pub current_round_number: i64,
    pub next_round_time: DateTime<Utc>,
    pub status: PlanetStatus,
    pub last_processed: Option<DateTime<Utc>>,
    pub processing_server_id: Option<String>,
    #[serde(default)]
    pub error_retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanetStatus {
    Queued,
    Processing,
    Error,
}

impl fmt::Display for PlanetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanetStatus::Queued => write!(f, "queued"),
            PlanetStatus::Processing => write!(f, "processing"),
            PlanetStatus::Error => write!(f, "error"),
        }
    }
}

impl Planet {
    /// A freshly created planet is immediately due (P3: it belongs in the index).
    pub fn new(planet_id: String, season_id: i64, round_id: i64, current_round_number: i64, now: DateTime<Utc>) -> Self {
        Self {
            planet_id,
            season_id,
            round_id,
            current_round_number,
            next_round_time: now,
            status: PlanetStatus::Queued,
            last_processed: None,
            processing_server_id: None,
            error_retry_count: 0,
        }
    }

    /// P3: indexed iff queued or error.
    pub fn belongs_in_index(&self) -> bool {
        matches!(self.status, PlanetStatus::Queued | PlanetStatus::Error)
    }

    /// Validate the id charset/length per spec §3: max 100 chars, [A-Za-z0-9_-].
    pub fn validate_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 100
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

/// An external node capable of processing one planet at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub server_id: String,
    pub server_ip: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub idle_cpu: f64,
    #[serde(default)]
    pub max_cpu: f64,
    #[serde(default)]
    pub idle_ram: f64,
    #[serde(default)]
    pub max_ram: f64,
    #[serde(default)]
    pub disk: f64,
    pub current_task: Option<String>,
    #[serde(default)]
    pub total_assigned: u64,
    #[serde(default)]
    pub total_completed: u64,
    #[serde(default)]
    pub total_failed: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Offline,
    NotInitialized,
    Idle,
    Busy,
    NotResponding,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Offline => "offline",
            WorkerStatus::NotInitialized => "not_initialized",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::NotResponding => "not_responding",
        };
        write!(f, "{s}")
    }
}

impl Worker {
    /// First-connect lifecycle: created in `not_initialized` (spec §4.E).
    pub fn new_connected(server_id: String, server_ip: String, now: DateTime<Utc>) -> Self {
        Self {
            server_id,
            server_ip,
            status: WorkerStatus::NotInitialized,
            last_heartbeat: now,
            idle_cpu: 0.0,
            max_cpu: 0.0,
            idle_ram: 0.0,
            max_ram: 0.0,
            disk: 0.0,
            current_task: None,
            total_assigned: 0,
            total_completed: 0,
            total_failed: 0,
            connected_at: Some(now),
            disconnected_at: None,
        }
    }

    /// Reconnection lifecycle: reset to `not_initialized`. Returns any
    /// in-flight task the prior session left behind, for the caller to
    /// reclaim (spec §4.E, §6.1 "re-attachment replaces the prior session").
    pub fn reconnect(&mut self, now: DateTime<Utc>) -> Option<String> {
        let orphaned_task = self.current_task.take();
        self.status = WorkerStatus::NotInitialized;
        self.last_heartbeat = now;
        self.connected_at = Some(now);
        self.disconnected_at = None;
        orphaned_task
    }

    /// W1: busy iff current_task is set.
    pub fn is_consistent(&self) -> bool {
        (self.status == WorkerStatus::Busy) == self.current_task.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Started,
    Completed,
    Failed,
    Timeout,
}

/// One row per (planet, worker) attempt; retries update rather than append (H1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub id: u64,
    pub planet_id: String,
    pub server_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TaskOutcome,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl TaskHistory {
    pub fn start(id: u64, planet_id: String, server_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            planet_id,
            server_id,
            start_time: now,
            end_time: None,
            status: TaskOutcome::Started,
            error_message: None,
            duration_seconds: None,
        }
    }

    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.status = TaskOutcome::Started;
        self.start_time = now;
        self.end_time = None;
        self.error_message = None;
        self.duration_seconds = None;
    }

    pub fn close(&mut self, status: TaskOutcome, now: DateTime<Utc>, error_message: Option<String>) {
        self.status = status;
        self.end_time = Some(now);
        self.error_message = error_message;
        self.duration_seconds = Some((now - self.start_time).num_milliseconds() as f64 / 1000.0);
    }
}
