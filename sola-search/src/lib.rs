//! sola-search library - frame search request path
//!
//! Admission control in front of a fan-out search over the shard cluster:
//! - Monthly quota, per-account concurrency and per-tier queue fairness
//! - Parallel shard queries with a single adaptive retry
//! - Temporal merge of hits into scenes and signed preview links

use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod accounts;
pub mod admission;
pub mod api;
pub mod counters;
pub mod enrichment;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod merge;
pub mod orchestrator;
pub mod service;
pub mod shard_client;
pub mod signing;

pub use error::SearchError;
pub use service::SearchService;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SearchService>,
}

impl AppState {
    pub fn new(service: Arc<SearchService>) -> Self {
        Self { service }
    }
}

/// Build application router
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/search", get(api::search).post(api::search))
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
