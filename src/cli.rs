//! CLI arguments for herakles-proxy.
//!
//! This module defines the command-line interface structure using the clap library.

use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Default, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug, Default)]
#[command(
    name = "herakles-proxy",
    about = "Monitoring proxy that buffers collected data and forwards it upstream",
    long_about = "Monitoring proxy that buffers collected data and forwards it upstream.\n\n\
                  Polls configured items, keeps recent history in a local database and a \
                  value cache, and delivers history, discovery and autoregistration data to \
                  the server with at-least-once semantics.",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    /// Admin HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind the admin listener to a specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level (overrides the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Upstream server address
    #[arg(long)]
    pub server: Option<String>,

    /// Proxy name announced to the server
    #[arg(long)]
    pub hostname: Option<String>,

    /// SQLite database file
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
