//! Configuration management for herakles-proxy.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat, LogLevel};
use crate::configcache::ItemConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9216;
pub const DEFAULT_SERVER_PORT: u16 = 10051;
pub const DEFAULT_DB_PATH: &str = "/var/lib/herakles/proxy.db";

/// Enhanced configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Identity and upstream
    pub hostname: Option<String>,
    pub server: Option<String>,
    pub server_port: Option<u16>,
    /// "unencrypted" is the only transport compiled in.
    pub tls_connect: Option<String>,

    // Storage
    pub db_path: Option<PathBuf>,

    // Admin listener
    pub bind: Option<String>,
    pub port: Option<u16>,

    // Server communication
    pub timeout_secs: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    pub data_sender_frequency_secs: Option<u64>,
    pub task_frequency_secs: Option<u64>,
    /// 0 disables heartbeats.
    pub heartbeat_frequency_secs: Option<u64>,
    pub proxy_data_max_records: Option<usize>,
    pub proxy_data_max_bytes: Option<usize>,

    // Caches
    pub history_cache_size_kb: Option<usize>,
    pub value_cache_size_kb: Option<usize>,
    pub value_cache_max_size_kb: Option<usize>,
    pub values_per_item: Option<usize>,

    // History syncer
    pub sync_batch_size: Option<usize>,
    pub sync_delay_secs: Option<u64>,

    // Housekeeping
    /// 0 runs the housekeeper only on demand.
    pub housekeeping_frequency_hours: Option<u64>,
    pub proxy_local_buffer_hours: Option<u64>,
    pub proxy_offline_buffer_hours: Option<u64>,

    // Collectors
    pub disk_device_ttl_secs: Option<u64>,

    // Logging
    pub log_level: Option<String>,

    /// Statically configured poll items.
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: Some("herakles-proxy".into()),
            server: None,
            server_port: Some(DEFAULT_SERVER_PORT),
            tls_connect: Some("unencrypted".into()),
            db_path: Some(PathBuf::from(DEFAULT_DB_PATH)),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            timeout_secs: Some(4),
            retry_interval_secs: Some(5),
            data_sender_frequency_secs: Some(1),
            task_frequency_secs: Some(5),
            heartbeat_frequency_secs: Some(60),
            proxy_data_max_records: Some(1000),
            proxy_data_max_bytes: Some(4 * 1024 * 1024),
            history_cache_size_kb: Some(16 * 1024),
            value_cache_size_kb: Some(8 * 1024),
            value_cache_max_size_kb: Some(64 * 1024),
            values_per_item: Some(1000),
            sync_batch_size: Some(1000),
            sync_delay_secs: Some(1),
            housekeeping_frequency_hours: Some(1),
            proxy_local_buffer_hours: Some(0),
            proxy_offline_buffer_hours: Some(1),
            disk_device_ttl_secs: Some(crate::collectors::diskstats::DEFAULT_DEVICE_TTL_SECS as u64),
            log_level: Some("info".into()),
            items: Vec::new(),
        }
    }
}

/// Effective settings with every default applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hostname: String,
    pub server: String,
    pub server_port: u16,
    pub db_path: PathBuf,
    pub bind: String,
    pub port: u16,
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub data_sender_frequency: Duration,
    pub task_frequency: Duration,
    pub heartbeat_frequency: Duration,
    pub proxy_data_max_records: usize,
    pub proxy_data_max_bytes: usize,
    pub history_cache_bytes: usize,
    pub value_cache_bytes: usize,
    pub value_cache_max_bytes: usize,
    pub values_per_item: usize,
    pub sync_batch_size: usize,
    pub sync_delay: Duration,
    pub housekeeping_frequency: Duration,
    pub local_buffer_secs: i64,
    pub offline_buffer_secs: i64,
    pub disk_device_ttl_secs: i64,
}

impl Config {
    /// Applies defaults to unset keys. Call after validation.
    pub fn settings(&self) -> Settings {
        let d = Config::default();
        let secs = |v: Option<u64>, dv: Option<u64>| Duration::from_secs(v.or(dv).unwrap_or(0));
        let kb = |v: Option<usize>, dv: Option<usize>| v.or(dv).unwrap_or(0) * 1024;
        let hours = |v: Option<u64>, dv: Option<u64>| (v.or(dv).unwrap_or(0) * 3600) as i64;
        Settings {
            hostname: self.hostname.clone().or(d.hostname).unwrap_or_default(),
            server: self.server.clone().unwrap_or_default(),
            server_port: self.server_port.or(d.server_port).unwrap_or(DEFAULT_SERVER_PORT),
            db_path: self.db_path.clone().or(d.db_path).unwrap_or_default(),
            bind: self.bind.clone().or(d.bind).unwrap_or_default(),
            port: self.port.or(d.port).unwrap_or(DEFAULT_PORT),
            timeout: secs(self.timeout_secs, d.timeout_secs),
            retry_interval: secs(self.retry_interval_secs, d.retry_interval_secs),
            data_sender_frequency: secs(self.data_sender_frequency_secs, d.data_sender_frequency_secs),
            task_frequency: secs(self.task_frequency_secs, d.task_frequency_secs),
            heartbeat_frequency: secs(self.heartbeat_frequency_secs, d.heartbeat_frequency_secs),
            proxy_data_max_records: self
                .proxy_data_max_records
                .or(d.proxy_data_max_records)
                .unwrap_or(1),
            proxy_data_max_bytes: self
                .proxy_data_max_bytes
                .or(d.proxy_data_max_bytes)
                .unwrap_or(0),
            history_cache_bytes: kb(self.history_cache_size_kb, d.history_cache_size_kb),
            value_cache_bytes: kb(self.value_cache_size_kb, d.value_cache_size_kb),
            value_cache_max_bytes: kb(self.value_cache_max_size_kb, d.value_cache_max_size_kb),
            values_per_item: self.values_per_item.or(d.values_per_item).unwrap_or(1),
            sync_batch_size: self.sync_batch_size.or(d.sync_batch_size).unwrap_or(1),
            sync_delay: secs(self.sync_delay_secs, d.sync_delay_secs),
            housekeeping_frequency: secs(
                self.housekeeping_frequency_hours.map(|h| h * 3600),
                d.housekeeping_frequency_hours.map(|h| h * 3600),
            ),
            local_buffer_secs: hours(self.proxy_local_buffer_hours, d.proxy_local_buffer_hours),
            offline_buffer_secs: hours(self.proxy_offline_buffer_hours, d.proxy_offline_buffer_hours),
            disk_device_ttl_secs: self
                .disk_device_ttl_secs
                .or(d.disk_device_ttl_secs)
                .unwrap_or(0) as i64,
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.hostname.as_deref().is_some_and(|h| h.trim().is_empty()) {
        return Err("hostname must not be empty".into());
    }

    if cfg.server.as_deref().map_or(true, |s| s.trim().is_empty()) {
        return Err("server is not set".into());
    }

    match cfg.tls_connect.as_deref().unwrap_or("unencrypted") {
        "unencrypted" => {}
        mode @ ("psk" | "cert") => {
            return Err(format!(
                "tls_connect is set to '{}', but TLS support is not compiled in",
                mode
            )
            .into());
        }
        other => {
            return Err(format!(
                "Invalid tls_connect '{}', expected 'unencrypted', 'psk' or 'cert'",
                other
            )
            .into());
        }
    }

    let local = cfg.proxy_local_buffer_hours.unwrap_or(0);
    let offline = cfg.proxy_offline_buffer_hours.unwrap_or(1);
    if local > offline {
        return Err(format!(
            "proxy_local_buffer_hours ({}) must not exceed proxy_offline_buffer_hours ({})",
            local, offline
        )
        .into());
    }

    if cfg.proxy_data_max_records == Some(0) {
        return Err("proxy_data_max_records must be greater than 0".into());
    }

    if let (Some(size), Some(max)) = (cfg.value_cache_size_kb, cfg.value_cache_max_size_kb) {
        if max < size {
            return Err(format!(
                "value_cache_max_size_kb ({}) must not be smaller than value_cache_size_kb ({})",
                max, size
            )
            .into());
        }
    }

    if let Some(level) = cfg.log_level.as_deref() {
        if !matches!(level, "off" | "error" | "warn" | "info" | "debug" | "trace") {
            return Err(format!("Invalid log_level '{}'", level).into());
        }
    }

    let mut seen = HashSet::new();
    for item in &cfg.items {
        if !seen.insert(item.itemid) {
            return Err(format!("Duplicate item id {}", item.itemid).into());
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if let Some(server) = &args.server {
        config.server = Some(server.clone());
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = Some(hostname.clone());
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = Some(log_level_name(level).to_string());
    }

    Ok(config)
}

pub fn log_level_name(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Off => "off",
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Configuration file locations tried when none is given, in order.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/herakles/proxy.yaml",
    "/etc/herakles/proxy.yml",
    "/etc/herakles/proxy.json",
    "./herakles-proxy.yaml",
    "./herakles-proxy.yml",
    "./herakles-proxy.json",
];

/// The file `load_config` reads: `path` if given, else the first existing
/// default location. Reloads must read the same file.
pub fn config_file_path(path: Option<&str>) -> Option<PathBuf> {
    match path {
        Some(p) => Some(PathBuf::from(p)),
        None => find_config_file(DEFAULT_CONFIG_PATHS),
    }
}

/// First existing candidate, made absolute so a later working directory
/// change does not lose it.
pub fn find_config_file<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates.iter().find_map(|p| {
        let p: &Path = p.as_ref();
        p.exists()
            .then(|| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()))
    })
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    match config_file_path(path) {
        Some(path) => load_config_file(&path),
        None => Ok(Config::default()),
    }
}

/// Loads one file; a missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if !path.exists() || path.as_os_str().is_empty() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        Config {
            server: Some("zabbix.example.com".into()),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_need_a_server() {
        assert!(validate_effective_config(&Config::default()).is_err());
        assert!(validate_effective_config(&valid()).is_ok());
    }

    #[test]
    fn test_invalid_combinations() {
        let mut cfg = valid();
        cfg.tls_connect = Some("psk".into());
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = valid();
        cfg.proxy_local_buffer_hours = Some(5);
        cfg.proxy_offline_buffer_hours = Some(2);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = valid();
        cfg.proxy_data_max_records = Some(0);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = valid();
        cfg.value_cache_size_kb = Some(1024);
        cfg.value_cache_max_size_kb = Some(512);
        assert!(validate_effective_config(&cfg).is_err());

        let mut cfg = valid();
        cfg.hostname = Some("  ".into());
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn test_yaml_file_and_cli_precedence() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server: file.example.com\nport: 9400\nitems:\n  - itemid: 1\n    hostid: 1\n    host: db01\n    key: agent.ping\n    value_type: uint"
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            server: Some("cli.example.com".into()),
            ..Args::default()
        };
        let cfg = resolve_config(&args).unwrap();
        assert_eq!(cfg.server.as_deref(), Some("cli.example.com"));
        assert_eq!(cfg.port, Some(9400));
        assert_eq!(cfg.items.len(), 1);
        assert_eq!(cfg.items[0].delay_secs, 60);

        // Keys absent from the file fall back to defaults.
        let settings = cfg.settings();
        assert_eq!(settings.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(settings.housekeeping_frequency, Duration::from_secs(3600));
        assert_eq!(settings.value_cache_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_duplicate_items_rejected() {
        let mut cfg = valid();
        let item = ItemConfig {
            itemid: 5,
            hostid: 1,
            host: "h".into(),
            key: "agent.ping".into(),
            value_type: crate::history::ValueType::Uint,
            delay_secs: 10,
            triggers: vec![],
        };
        cfg.items = vec![item.clone(), item];
        assert!(validate_effective_config(&cfg).is_err());
    }
}
