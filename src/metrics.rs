//! Prometheus metrics definitions for herakles-proxy.
//!
//! Components count into [`PipelineStats`]; the metrics handler copies the
//! current values into these collectors right before encoding a scrape.

use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Opts, Registry};

use crate::comms::LinkStats;
use crate::stats::PipelineSnapshot;
use crate::valuecache::{CacheMode, ValueCacheStats};
use crate::writebuffer::WriteBufferStats;

/// Collection of Prometheus metrics exported by the admin listener.
#[derive(Clone)]
pub struct ProxyMetrics {
    // ========== Value cache ==========
    pub value_cache_total_bytes: Gauge,
    pub value_cache_free_bytes: Gauge,
    pub value_cache_items: Gauge,
    pub value_cache_values: Gauge,
    pub value_cache_hits_total: Counter,
    pub value_cache_misses_total: Counter,
    pub value_cache_low_memory: Gauge,

    // ========== Write buffer ==========
    pub write_buffer_queued_values: Gauge,
    pub write_buffer_free_bytes: Gauge,
    pub write_buffer_rejected_total: Counter,

    // ========== Poller ==========
    pub polls_total: Counter,
    pub poll_errors_total: Counter,

    // ========== History syncer ==========
    pub values_synced_total: Counter,
    pub sync_failures_total: Counter,
    pub sync_duration_seconds: Gauge,

    // ========== Data sender ==========
    pub envelopes_sent_total: Counter,
    pub envelopes_failed_total: Counter,
    pub records_sent_total: CounterVec, // labels: stream
    pub checkpoint_lastid: GaugeVec,    // labels: stream
    pub connection_failures_total: Counter,
    pub server_link_up: Gauge,
    pub heartbeats_sent_total: Counter,
    pub heartbeats_failed_total: Counter,

    // ========== Housekeeper ==========
    pub housekeeper_deleted_rows_total: Counter,
    pub housekeeper_passes_total: Counter,
    pub housekeeper_duration_seconds: Gauge,
}

/// Raises a monotonic counter to `target`. Counters never go backwards.
fn advance(counter: &Counter, target: u64) {
    let delta = target as f64 - counter.get();
    if delta > 0.0 {
        counter.inc_by(delta);
    }
}

impl ProxyMetrics {
    /// Creates and registers all Prometheus metrics with the registry.
    pub fn new(registry: &Registry) -> Result<Self, Box<dyn std::error::Error>> {
        // ========== Value cache ==========
        let value_cache_total_bytes = Gauge::new(
            "herakles_proxy_value_cache_total_bytes",
            "Value cache capacity in bytes",
        )?;
        let value_cache_free_bytes = Gauge::new(
            "herakles_proxy_value_cache_free_bytes",
            "Free value cache bytes",
        )?;
        let value_cache_items = Gauge::new(
            "herakles_proxy_value_cache_items",
            "Number of items held in the value cache",
        )?;
        let value_cache_values = Gauge::new(
            "herakles_proxy_value_cache_values",
            "Number of values held in the value cache",
        )?;
        let value_cache_hits_total = Counter::new(
            "herakles_proxy_value_cache_hits_total",
            "Values served from the value cache",
        )?;
        let value_cache_misses_total = Counter::new(
            "herakles_proxy_value_cache_misses_total",
            "Values read from the database by the value cache",
        )?;
        let value_cache_low_memory = Gauge::new(
            "herakles_proxy_value_cache_low_memory",
            "1 while the value cache runs in low memory mode",
        )?;

        // ========== Write buffer ==========
        let write_buffer_queued_values = Gauge::new(
            "herakles_proxy_write_buffer_queued_values",
            "Collected values waiting for the history syncer",
        )?;
        let write_buffer_free_bytes = Gauge::new(
            "herakles_proxy_write_buffer_free_bytes",
            "Free write buffer bytes",
        )?;
        let write_buffer_rejected_total = Counter::new(
            "herakles_proxy_write_buffer_rejected_total",
            "Values rejected because the write buffer was full",
        )?;

        // ========== Poller ==========
        let polls_total = Counter::new("herakles_proxy_polls_total", "Item polls performed")?;
        let poll_errors_total = Counter::new(
            "herakles_proxy_poll_errors_total",
            "Item polls that returned an error",
        )?;

        // ========== History syncer ==========
        let values_synced_total = Counter::new(
            "herakles_proxy_values_synced_total",
            "Values written to the database by the history syncer",
        )?;
        let sync_failures_total = Counter::new(
            "herakles_proxy_sync_failures_total",
            "History sync passes aborted by a database error",
        )?;
        let sync_duration_seconds = Gauge::new(
            "herakles_proxy_sync_duration_seconds",
            "Duration of the last history sync pass",
        )?;

        // ========== Data sender ==========
        let envelopes_sent_total = Counter::new(
            "herakles_proxy_envelopes_sent_total",
            "Proxy data envelopes acknowledged by the server",
        )?;
        let envelopes_failed_total = Counter::new(
            "herakles_proxy_envelopes_failed_total",
            "Proxy data envelopes that were not acknowledged",
        )?;
        let records_sent_total = CounterVec::new(
            Opts::new(
                "herakles_proxy_records_sent_total",
                "Records delivered to the server",
            ),
            &["stream"],
        )?;
        let checkpoint_lastid = GaugeVec::new(
            Opts::new(
                "herakles_proxy_checkpoint_lastid",
                "Last acknowledged record id",
            ),
            &["stream"],
        )?;
        let connection_failures_total = Counter::new(
            "herakles_proxy_connection_failures_total",
            "Failed connection attempts to the server",
        )?;
        let server_link_up = Gauge::new(
            "herakles_proxy_server_link_up",
            "0 while connection attempts to the server keep failing",
        )?;
        let heartbeats_sent_total = Counter::new(
            "herakles_proxy_heartbeats_sent_total",
            "Heartbeats acknowledged by the server",
        )?;
        let heartbeats_failed_total = Counter::new(
            "herakles_proxy_heartbeats_failed_total",
            "Heartbeats that failed",
        )?;

        // ========== Housekeeper ==========
        let housekeeper_deleted_rows_total = Counter::new(
            "herakles_proxy_housekeeper_deleted_rows_total",
            "Rows deleted by the housekeeper",
        )?;
        let housekeeper_passes_total = Counter::new(
            "herakles_proxy_housekeeper_passes_total",
            "Housekeeper passes performed",
        )?;
        let housekeeper_duration_seconds = Gauge::new(
            "herakles_proxy_housekeeper_duration_seconds",
            "Duration of the last housekeeper pass",
        )?;

        registry.register(Box::new(value_cache_total_bytes.clone()))?;
        registry.register(Box::new(value_cache_free_bytes.clone()))?;
        registry.register(Box::new(value_cache_items.clone()))?;
        registry.register(Box::new(value_cache_values.clone()))?;
        registry.register(Box::new(value_cache_hits_total.clone()))?;
        registry.register(Box::new(value_cache_misses_total.clone()))?;
        registry.register(Box::new(value_cache_low_memory.clone()))?;

        registry.register(Box::new(write_buffer_queued_values.clone()))?;
        registry.register(Box::new(write_buffer_free_bytes.clone()))?;
        registry.register(Box::new(write_buffer_rejected_total.clone()))?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_errors_total.clone()))?;

        registry.register(Box::new(values_synced_total.clone()))?;
        registry.register(Box::new(sync_failures_total.clone()))?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        registry.register(Box::new(envelopes_sent_total.clone()))?;
        registry.register(Box::new(envelopes_failed_total.clone()))?;
        registry.register(Box::new(records_sent_total.clone()))?;
        registry.register(Box::new(checkpoint_lastid.clone()))?;
        registry.register(Box::new(connection_failures_total.clone()))?;
        registry.register(Box::new(server_link_up.clone()))?;
        registry.register(Box::new(heartbeats_sent_total.clone()))?;
        registry.register(Box::new(heartbeats_failed_total.clone()))?;

        registry.register(Box::new(housekeeper_deleted_rows_total.clone()))?;
        registry.register(Box::new(housekeeper_passes_total.clone()))?;
        registry.register(Box::new(housekeeper_duration_seconds.clone()))?;

        Ok(Self {
            value_cache_total_bytes,
            value_cache_free_bytes,
            value_cache_items,
            value_cache_values,
            value_cache_hits_total,
            value_cache_misses_total,
            value_cache_low_memory,
            write_buffer_queued_values,
            write_buffer_free_bytes,
            write_buffer_rejected_total,
            polls_total,
            poll_errors_total,
            values_synced_total,
            sync_failures_total,
            sync_duration_seconds,
            envelopes_sent_total,
            envelopes_failed_total,
            records_sent_total,
            checkpoint_lastid,
            connection_failures_total,
            server_link_up,
            heartbeats_sent_total,
            heartbeats_failed_total,
            housekeeper_deleted_rows_total,
            housekeeper_passes_total,
            housekeeper_duration_seconds,
        })
    }

    pub fn update_value_cache(&self, stats: &ValueCacheStats) {
        self.value_cache_total_bytes.set(stats.total_size as f64);
        self.value_cache_free_bytes.set(stats.free_size as f64);
        self.value_cache_items.set(stats.items as f64);
        self.value_cache_values.set(stats.values as f64);
        advance(&self.value_cache_hits_total, stats.hits);
        advance(&self.value_cache_misses_total, stats.misses);
        self.value_cache_low_memory
            .set(if stats.mode == CacheMode::LowMemory { 1.0 } else { 0.0 });
    }

    pub fn update_write_buffer(&self, stats: &WriteBufferStats) {
        self.write_buffer_queued_values.set(stats.queued as f64);
        self.write_buffer_free_bytes.set(stats.free_size as f64);
        advance(&self.write_buffer_rejected_total, stats.rejected);
    }

    pub fn update_pipeline(&self, s: &PipelineSnapshot) {
        advance(&self.polls_total, s.polls);
        advance(&self.poll_errors_total, s.poll_errors);

        advance(&self.values_synced_total, s.values_synced);
        advance(&self.sync_failures_total, s.sync_failures);
        self.sync_duration_seconds.set(s.sync_duration_seconds.last);

        advance(&self.envelopes_sent_total, s.envelopes_sent);
        advance(&self.envelopes_failed_total, s.envelopes_failed);
        for (stream, sent) in [
            ("availability", s.availability_sent),
            ("history", s.history_sent),
            ("discovery", s.discovery_sent),
            ("autoregistration", s.autoregistration_sent),
            ("tasks", s.tasks_sent),
        ] {
            advance(&self.records_sent_total.with_label_values(&[stream]), sent);
        }
        advance(&self.heartbeats_sent_total, s.heartbeats_sent);
        advance(&self.heartbeats_failed_total, s.heartbeats_failed);

        advance(&self.housekeeper_deleted_rows_total, s.housekeeper_deleted);
        advance(&self.housekeeper_passes_total, s.housekeeper_passes);
        self.housekeeper_duration_seconds
            .set(s.housekeeper_duration_seconds.last);
    }

    pub fn update_link(&self, link: &LinkStats) {
        advance(&self.connection_failures_total, link.failures);
        self.server_link_up.set(if link.down { 0.0 } else { 1.0 });
    }

    pub fn set_checkpoint(&self, stream: &str, lastid: i64) {
        self.checkpoint_lastid
            .with_label_values(&[stream])
            .set(lastid as f64);
    }
}
