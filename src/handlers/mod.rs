//! HTTP endpoint handlers for the admin listener.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/`: Landing page
//! - `/metrics`: Prometheus metrics endpoint
//! - `/stats`: Internal statistics (JSON)
//! - `/health`: Health check endpoint
//! - `/runtime/*`: On-demand housekeeping and configuration reload

pub mod health;
pub mod metrics;
pub mod root;
pub mod runtime;
pub mod stats;

// Re-export handlers
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use root::root_handler;
pub use runtime::{config_cache_reload_handler, housekeeper_execute_handler};
pub use stats::stats_handler;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

/// Builds the admin router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route(
            "/runtime/housekeeper_execute",
            post(housekeeper_execute_handler),
        )
        .route(
            "/runtime/config_cache_reload",
            post(config_cache_reload_handler),
        )
        .with_state(state)
}
