//! Worker connections
//!
//! Workers connect to `/ws?type=hash|load`. Job descriptors are pushed as
//! JSON text frames. Any text frame from the worker means it finished its
//! current job and is READY again, which triggers a scheduling pass.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::scheduler::JobType;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkerParams {
    #[serde(rename = "type", default)]
    pub job_type: String,
}

/// GET /ws
pub async fn worker_socket(
    State(state): State<AppState>,
    Query(params): Query<WorkerParams>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let job_type: JobType = params.job_type.parse()?;
    Ok(ws.on_upgrade(move |socket| serve_worker(state, job_type, socket)))
}

async fn serve_worker(state: AppState, job_type: JobType, socket: WebSocket) {
    let scheduler = state.scheduler;
    let (id, mut jobs) = scheduler.register(job_type);
    let (mut sink, mut stream) = socket.split();

    let forward = tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let text = match serde_json::to_string(&job) {
                Ok(text) => text,
                Err(e) => {
                    warn!(worker = %id, "Failed to encode job: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    scheduler.schedule().await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                debug!(worker = %id, message = %text, "Worker ready");
                scheduler.mark_ready(id);
                scheduler.schedule().await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(worker = %id, "Worker socket error: {}", e);
                break;
            }
        }
    }

    scheduler.unregister(id);
    forward.abort();
}
