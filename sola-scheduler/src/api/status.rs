//! Worker pool snapshot

use axum::{extract::State, Json};

use crate::scheduler::WorkerSlot;
use crate::AppState;

/// GET /status
pub async fn worker_status(State(state): State<AppState>) -> Json<Vec<WorkerSlot>> {
    Json(state.scheduler.snapshot())
}
