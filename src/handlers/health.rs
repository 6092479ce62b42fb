//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns a
//! plain-text summary of the proxy pipeline.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::state::SharedState;
use crate::store::Stream;
use crate::valuecache::CacheMode;

// Time conversion constants
const SECONDS_PER_HOUR: f64 = 3600.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "herakles-proxy";

/// Formats an uptime for humans.
pub fn format_uptime(uptime_seconds: u64) -> String {
    let uptime_hours = uptime_seconds as f64 / SECONDS_PER_HOUR;
    if uptime_hours < 1.0 {
        format!("{:.1} minutes", uptime_hours * MINUTES_PER_HOUR)
    } else if uptime_hours < HOURS_PER_DAY {
        format!("{:.1} hours", uptime_hours)
    } else {
        format!("{:.1} days", uptime_hours / HOURS_PER_DAY)
    }
}

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let link = state.comms.link_stats();
    let cache = state.value_cache.stats();
    let buffer = state.write_buffer.stats();

    let status = if link.down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let message = if link.down {
        "Server unreachable"
    } else if cache.mode == CacheMode::LowMemory {
        "OK - Value cache in low memory mode"
    } else {
        "OK"
    };

    let uptime_str = format_uptime(state.start_time.elapsed().as_secs());

    let mut table = String::new();
    writeln!(table, "{:25} | {:>15}", "Component", "Value").ok();
    writeln!(table, "{}", "-".repeat(43)).ok();
    writeln!(table, "{:25} | {:>15}", "Write buffer queued", buffer.queued).ok();
    writeln!(table, "{:25} | {:>15}", "Write buffer free (KB)", buffer.free_size / 1024).ok();
    writeln!(table, "{:25} | {:>15}", "Value cache items", cache.items).ok();
    writeln!(table, "{:25} | {:>15}", "Value cache free (KB)", cache.free_size / 1024).ok();
    writeln!(table, "{:25} | {:>15}", "Connection failures", link.failures).ok();
    for stream in Stream::ALL {
        let lastid = state.store.checkpoint(stream).unwrap_or(-1);
        writeln!(table, "{:25} | {:>15}", format!("Checkpoint {}", stream), lastid).ok();
    }

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{message}\n\nUptime: {uptime_str}\n\n{table}\n{FOOTER_TEXT}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(90), "1.5 minutes");
        assert_eq!(format_uptime(2 * 3600), "2.0 hours");
        assert_eq!(format_uptime(3 * 86400), "3.0 days");
    }
}
