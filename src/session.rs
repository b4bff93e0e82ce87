//! Session Layer (spec §4.E): frame catalog and the outbound handle each
//! connected worker's websocket task holds.
//!
//! Adapted from `knhk-sidecar`'s `ClientConfig`/connection-lifecycle shape
//! in `client.rs`, inverted: instead of the sidecar calling out to a warm
//! orchestrator, each worker session here is called into by the core and
//! drains a bounded outbound queue into its own websocket task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Inbound frames, tagged by `type` (spec §4.E). Unknown tags are a
/// non-fatal protocol-violation (logged, frame ignored); see `ws.rs`.
///
/// Open Question (a): two naming conventions for completion fields
/// coexist during a client migration window; `serde(alias = ...)` accepts
/// both, emission always uses the §6.1-listed names.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Heartbeat {
        #[serde(default)]
        idle_cpu: f64,
        #[serde(default)]
        max_cpu: f64,
        #[serde(default)]
        idle_ram: f64,
        #[serde(default)]
        max_ram: f64,
        #[serde(default)]
        disk: f64,
    },
    StatusUpdate {
        status: InboundWorkerStatus,
    },
    JobDone {
        #[serde(alias = "map_id")]
        planet_id: String,
        #[serde(alias = "next_calculation_time")]
        next_round_time: DateTime<Utc>,
    },
    JobSkipped {
        #[serde(alias = "map_id")]
        planet_id: String,
        #[serde(alias = "next_calculation_time")]
        next_round_time: DateTime<Utc>,
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(default, alias = "map_id")]
        planet_id: Option<String>,
        error: String,
    },
    Disconnect {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundWorkerStatus {
    Idle,
    Busy,
    NotInitialized,
}

/// Outbound frames (spec §4.E).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    AssignJob {
        planet_id: String,
        season_id: i64,
        round_id: i64,
    },
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    Pong {},
}

/// What the Registry holds per connected worker: a cheap, cloneable handle
/// onto that worker's bounded outbound queue. The websocket task on the
/// other end owns the receiver and writes frames to the socket in
/// submission order (spec §5 ordering guarantee 1).
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { outbound }
    }

    /// Non-blocking send; a full queue means the worker is likely stuck and
    /// the caller (Assignment Engine) must abort rather than await
    /// indefinitely (spec §5 backpressure).
    pub fn try_send(&self, frame: OutboundFrame) -> OrchestratorResult<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                OrchestratorError::OutboundQueueFull("worker outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                OrchestratorError::OutboundQueueFull("worker session closed".into())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_frame_parses_and_never_touches_status() {
        let raw = r#"{"type":"heartbeat","idle_cpu":0.5,"max_cpu":4.0,"idle_ram":1024.0,"max_ram":8192.0,"disk":0.2}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::Heartbeat { idle_cpu, .. } if idle_cpu == 0.5));
    }

    #[test]
    fn job_done_accepts_both_legacy_and_canonical_field_names() {
        let canonical = r#"{"type":"job_done","planet_id":"p1","next_round_time":"2025-01-01T00:01:00Z"}"#;
        let legacy = r#"{"type":"job_done","map_id":"p1","next_calculation_time":"2025-01-01T00:01:00Z"}"#;
        for raw in [canonical, legacy] {
            let frame: InboundFrame = serde_json::from_str(raw).unwrap();
            match frame {
                InboundFrame::JobDone { planet_id, .. } => assert_eq!(planet_id, "p1"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize_as_protocol_violation() {
        let raw = r#"{"type":"teleport","x":1}"#;
        assert!(serde_json::from_str::<InboundFrame>(raw).is_err());
    }

    #[tokio::test]
    async fn full_outbound_queue_surfaces_as_queue_full_error() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = SessionHandle::new(tx);
        handle.try_send(OutboundFrame::Pong {}).unwrap();
        let err = handle.try_send(OutboundFrame::Pong {}).unwrap_err();
        assert!(matches!(err, OrchestratorError::OutboundQueueFull(_)));
        rx.recv().await;
    }
}
