//! Internal statistics endpoint handler.
//!
//! `/stats` returns one JSON document with the value cache, write buffer,
//! checkpoint and pipeline counters.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::stats::PipelineSnapshot;
use crate::state::SharedState;
use crate::store::Stream;
use crate::valuecache::ValueCacheStats;
use crate::writebuffer::WriteBufferStats;

#[derive(Debug, Serialize)]
pub struct LinkReport {
    pub failures: u64,
    pub restorations: u64,
    pub down: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub version: &'static str,
    pub hostname: String,
    pub uptime_seconds: u64,
    pub items: usize,
    pub config_revision: u64,
    pub value_cache: ValueCacheStats,
    pub write_buffer: WriteBufferStats,
    /// stream -> last acknowledged id
    pub checkpoints: BTreeMap<String, i64>,
    /// stream -> rows currently stored
    pub pending_rows: BTreeMap<String, i64>,
    pub server_link: LinkReport,
    pub pipeline: PipelineSnapshot,
}

pub fn collect_report(state: &SharedState) -> StatsReport {
    let mut checkpoints = BTreeMap::new();
    let mut pending_rows = BTreeMap::new();
    for stream in Stream::ALL {
        match state.store.checkpoint(stream) {
            Ok(lastid) => {
                checkpoints.insert(stream.name().to_string(), lastid);
            }
            Err(e) => warn!("Cannot read checkpoint of {}: {}", stream, e),
        }
        if let Ok(rows) = state.store.row_count(stream) {
            pending_rows.insert(stream.name().to_string(), rows);
        }
    }
    let link = state.comms.link_stats();

    StatsReport {
        version: env!("CARGO_PKG_VERSION"),
        hostname: state.settings.hostname.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        items: state.config_cache.len(),
        config_revision: state.config_cache.revision(),
        value_cache: state.value_cache.stats(),
        write_buffer: state.write_buffer.stats(),
        checkpoints,
        pending_rows,
        server_link: LinkReport {
            failures: link.failures,
            restorations: link.restorations,
            down: link.down,
        },
        pipeline: state.stats.snapshot(),
    }
}

/// Handler for the /stats endpoint.
#[instrument(skip(state))]
pub async fn stats_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /stats request");

    match serde_json::to_string_pretty(&collect_report(&state)) {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "application/json")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain; charset=utf-8")],
            format!("Failed to encode statistics: {}", e),
        ),
    }
}
