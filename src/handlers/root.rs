//! Root endpoint handler for the landing page.
//!
//! Shows the proxy identity, the upstream server, per-stream delivery
//! progress and links to the other admin endpoints.

use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::handlers::health::{format_uptime, FOOTER_TEXT};
use crate::state::SharedState;
use crate::store::Stream;

const STYLE: &str = "body{font-family:sans-serif;margin:2em auto;max-width:52em;color:#333}\
table{border-collapse:collapse}td,th{padding:4px 14px;border-bottom:1px solid #ddd;text-align:left}\
code{background:#eee;padding:1px 5px}";

/// Handler for the root `/` endpoint.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing / request");

    let settings = &state.settings;
    let link = state.comms.link_stats();

    let mut streams = String::new();
    for stream in Stream::ALL {
        let lastid = state.store.checkpoint(stream).unwrap_or(-1);
        let rows = state.store.row_count(stream).unwrap_or(-1);
        writeln!(
            streams,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            stream, lastid, rows
        )
        .ok();
    }

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Herakles Proxy</title><style>{STYLE}</style></head>
<body>
<h1>Herakles Proxy {version}</h1>
<table>
<tr><th>Proxy</th><td>{hostname}</td></tr>
<tr><th>Server</th><td>{server}:{port} ({link})</td></tr>
<tr><th>Uptime</th><td>{uptime}</td></tr>
<tr><th>Items</th><td>{items}</td></tr>
</table>
<h2>Delivery</h2>
<table>
<tr><th>Stream</th><th>Checkpoint</th><th>Stored rows</th></tr>
{streams}</table>
<h2>Endpoints</h2>
<ul>
<li><a href="/metrics">/metrics</a> Prometheus metrics</li>
<li><a href="/stats">/stats</a> internal statistics (JSON)</li>
<li><a href="/health">/health</a> health summary</li>
<li><code>POST /runtime/housekeeper_execute</code> run the housekeeper now</li>
<li><code>POST /runtime/config_cache_reload</code> reload the item configuration</li>
</ul>
<p><small>{FOOTER_TEXT}</small></p>
</body>
</html>"#,
        version = env!("CARGO_PKG_VERSION"),
        hostname = settings.hostname,
        server = settings.server,
        port = settings.server_port,
        link = if link.down { "unreachable" } else { "up" },
        uptime = format_uptime(state.start_time.elapsed().as_secs()),
        items = state.config_cache.len(),
    );

    Html(html)
}
