//! HTTP API handlers for sola-scheduler

pub mod health;
pub mod status;
pub mod ws;

pub use health::health_routes;
pub use status::worker_status;
pub use ws::worker_socket;
