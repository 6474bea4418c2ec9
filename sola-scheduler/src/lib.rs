//! sola-scheduler library - ingest job dispatch
//!
//! Hands queued media files to connected hash and load workers over
//! WebSockets, one job per READY worker, and picks the search core each
//! load job writes into.

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod shard_selector;

pub use error::SchedulerError;
pub use scheduler::Scheduler;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/ws", get(api::worker_socket))
        .route("/status", get(api::worker_status))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
