//! Application state management for the proxy.
//!
//! This module defines the process-wide context shared by the HTTP handlers
//! and the background tasks. Every shared region is created here once and
//! handed out as an attachment.

use prometheus::{Gauge, Registry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::collectors::diskstats::DiskCollector;
use crate::comms::{ServerComms, TcpConnector};
use crate::config::{load_config_file, validate_effective_config, Config, Settings};
use crate::configcache::{ConfigCache, ReloadSummary};
use crate::control::{RunFlag, Wakeup};
use crate::metrics::ProxyMetrics;
use crate::stats::PipelineStats;
use crate::store::{Store, Stream};
use crate::valuecache::ValueCache;
use crate::writebuffer::WriteBuffer;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests and background tasks.
pub struct AppState {
    pub registry: Registry,
    pub metrics: ProxyMetrics,
    pub scrape_duration: Gauge,
    pub config: Arc<Config>,
    /// File the configuration was loaded from, re-read on reload.
    pub config_path: Option<PathBuf>,
    pub settings: Settings,
    pub store: Arc<Store>,
    pub value_cache: ValueCache,
    pub write_buffer: WriteBuffer,
    pub config_cache: Arc<ConfigCache>,
    pub disks: Arc<DiskCollector>,
    pub stats: Arc<PipelineStats>,
    pub comms: Arc<ServerComms<TcpConnector>>,
    pub housekeeper_wakeup: Arc<Wakeup>,
    pub reload_wakeup: Arc<Wakeup>,
    pub run: RunFlag,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Opens the database and creates every shared region.
    pub fn build(
        config: Config,
        config_path: Option<PathBuf>,
        store: Store,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let settings = config.settings();
        let registry = Registry::new();
        let metrics = ProxyMetrics::new(&registry)?;
        let scrape_duration = Gauge::new(
            "herakles_proxy_scrape_duration_seconds",
            "Time spent serving the last /metrics request",
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let store = Arc::new(store);
        let value_cache = ValueCache::create(
            settings.value_cache_bytes,
            settings.value_cache_max_bytes,
            settings.values_per_item,
            store.clone(),
        );
        let write_buffer = WriteBuffer::create(settings.history_cache_bytes);

        let config_cache = Arc::new(ConfigCache::new());
        config_cache.reload(config.items.clone());

        let run = RunFlag::new();
        let comms = Arc::new(ServerComms::new(
            TcpConnector::new(&settings.server, settings.server_port),
            settings.timeout,
            run.clone(),
        ));

        Ok(Self {
            registry,
            metrics,
            scrape_duration,
            config: Arc::new(config),
            config_path,
            store,
            value_cache,
            write_buffer,
            config_cache,
            disks: Arc::new(DiskCollector::new(settings.disk_device_ttl_secs)),
            stats: Arc::new(PipelineStats::default()),
            comms,
            housekeeper_wakeup: Arc::new(Wakeup::new("housekeeper")),
            reload_wakeup: Arc::new(Wakeup::new("configuration cache reload")),
            run,
            start_time: Instant::now(),
            settings,
        })
    }

    /// Re-reads the item list from the configuration file.
    ///
    /// Without a file the items loaded at start-up are applied again.
    pub fn reload_items(&self) -> Result<ReloadSummary, String> {
        let items = match &self.config_path {
            Some(path) => {
                let cfg = load_config_file(path).map_err(|e| e.to_string())?;
                validate_items(&cfg)?;
                cfg.items
            }
            None => self.config.items.clone(),
        };
        let summary = self.config_cache.reload(items);
        info!(
            "Configuration cache reloaded: {} added, {} updated, {} removed",
            summary.added, summary.updated, summary.removed
        );
        Ok(summary)
    }

    /// Copies the current component counters into the Prometheus collectors.
    pub fn refresh_metrics(&self) {
        self.metrics.update_pipeline(&self.stats.snapshot());
        self.metrics.update_value_cache(&self.value_cache.stats());
        self.metrics.update_write_buffer(&self.write_buffer.stats());
        self.metrics.update_link(&self.comms.link_stats());
        for stream in Stream::ALL {
            if let Ok(lastid) = self.store.checkpoint(stream) {
                self.metrics.set_checkpoint(stream.name(), lastid);
            }
        }
    }
}

/// Item-level checks of a reloaded file. The server keys are not re-read.
fn validate_items(cfg: &Config) -> Result<(), String> {
    let items_only = Config {
        server: Some("reload".into()),
        items: cfg.items.clone(),
        ..Config::default()
    };
    validate_effective_config(&items_only).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::find_config_file;
    use std::io::Write;

    fn config() -> Config {
        Config {
            server: Some("127.0.0.1".into()),
            ..Config::default()
        }
    }

    #[test]
    fn test_build_and_refresh() {
        let state = AppState::build(config(), None, Store::open_in_memory().unwrap()).unwrap();
        state.refresh_metrics();
        assert_eq!(state.metrics.server_link_up.get(), 1.0);
        assert_eq!(
            state.metrics.value_cache_total_bytes.get(),
            (8 * 1024 * 1024) as f64
        );
    }

    #[test]
    fn test_reload_items_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "items:\n  - itemid: 7\n    hostid: 1\n    host: db01\n    key: agent.ping\n    value_type: uint"
        )
        .unwrap();
        let state = AppState::build(
            config(),
            Some(file.path().to_path_buf()),
            Store::open_in_memory().unwrap(),
        )
        .unwrap();
        assert!(state.config_cache.is_empty());

        let summary = state.reload_items().unwrap();
        assert_eq!(summary.added, 1);
        assert!(state.config_cache.item(7).is_some());
    }

    #[test]
    fn test_reload_reads_file_found_in_default_locations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        let item = |id: u64| {
            format!(
                "items:\n  - itemid: {}\n    hostid: 1\n    host: db01\n    key: agent.ping\n    value_type: uint\n",
                id
            )
        };
        std::fs::write(&path, item(1)).unwrap();

        let found = find_config_file(&[dir.path().join("missing.yaml"), path.clone()]).unwrap();
        let cfg = Config {
            server: Some("127.0.0.1".into()),
            ..load_config_file(&found).unwrap()
        };
        let state = AppState::build(cfg, Some(found), Store::open_in_memory().unwrap()).unwrap();
        assert!(state.config_cache.item(1).is_some());

        // The running proxy picks up edits to the file it started from.
        std::fs::write(&path, item(2)).unwrap();
        let summary = state.reload_items().unwrap();
        assert_eq!((summary.added, summary.removed), (1, 1));
        assert!(state.config_cache.item(1).is_none());
        assert!(state.config_cache.item(2).is_some());
    }
}
