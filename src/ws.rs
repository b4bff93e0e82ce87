//! Worker websocket route (spec §4.E, §6.1): `/ws/server/:server_id`.
//!
//! One task per connected worker drains its bounded outbound queue into
//! the socket while a second future reads and dispatches inbound frames —
//! the two-halves-of-one-connection shape `knhk-sidecar`'s `client.rs`
//! uses for its bidirectional gRPC stream, here split across
//! `axum::extract::ws::WebSocket`'s `split()` instead of a gRPC duplex.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::session::{InboundFrame, SessionHandle};
use crate::Orchestrator;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Path(server_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, server_id, addr.ip().to_string(), orchestrator))
}

#[instrument(skip(socket, orchestrator), fields(server_id = %server_id))]
async fn handle_session(socket: WebSocket, server_id: String, server_ip: String, orchestrator: Arc<Orchestrator>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(orchestrator.config.server.outbound_queue_capacity);

    if let Err(err) = orchestrator.connect_worker(&server_id, &server_ip, SessionHandle::new(tx)) {
        warn!(server_id, %err, "failed to register worker session");
        return;
    }

    let outbound_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                if let Err(err) = dispatch_inbound(&orchestrator, &server_id, &text).await {
                    warn!(server_id, %err, "protocol violation, frame dropped");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound_task.abort();
    if let Err(err) = orchestrator.disconnect_worker(&server_id) {
        warn!(server_id, %err, "error tearing down worker session");
    }
    info!(server_id, "session closed");
}

async fn dispatch_inbound(orchestrator: &Orchestrator, server_id: &str, text: &str) -> Result<(), crate::error::OrchestratorError> {
    let frame: InboundFrame = serde_json::from_str(text)
        .map_err(|e| crate::error::OrchestratorError::ProtocolViolation(e.to_string()))?;

    match frame {
        InboundFrame::Heartbeat {
            idle_cpu,
            max_cpu,
            idle_ram,
            max_ram,
            disk,
        } => {
            orchestrator.record_heartbeat(server_id, idle_cpu, max_cpu, idle_ram, max_ram, disk)?;
        }
        InboundFrame::StatusUpdate { status } => {
            if orchestrator.record_status_update(server_id, status)? {
                orchestrator.run_assignment_pass().await?;
            }
        }
        InboundFrame::JobDone {
            planet_id,
            next_round_time,
        } => {
            orchestrator.on_job_done(server_id, &planet_id, next_round_time).await?;
            orchestrator.run_assignment_pass().await?;
        }
        InboundFrame::JobSkipped {
            planet_id,
            next_round_time,
            reason,
        } => {
            orchestrator
                .on_job_skipped(server_id, &planet_id, next_round_time, reason)
                .await?;
            orchestrator.run_assignment_pass().await?;
        }
        InboundFrame::Error { planet_id, error } => {
            if let Some(planet_id) = planet_id {
                orchestrator.on_error(server_id, &planet_id, &error).await?;
            } else {
                warn!(server_id, error, "peer-reported error without a planet_id");
            }
        }
        InboundFrame::Disconnect {} => {
            orchestrator.disconnect_worker(server_id)?;
        }
    }
    Ok(())
}
