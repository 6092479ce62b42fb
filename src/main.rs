//! herakles-proxy - version 0.1.0
//!
//! Store-and-forward monitoring proxy with tracing logging.
//! This is the main entry point that opens the database, starts the
//! pipeline tasks and serves the admin listener.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tracing::{debug, error, info, warn, Level};

use herakles_proxy::cli::Args;
use herakles_proxy::collectors::{diskstats::run_collector, LocalMetricSource};
use herakles_proxy::config::{
    config_file_path, resolve_config, show_config, validate_effective_config, Config,
};
use herakles_proxy::control::WakeReason;
use herakles_proxy::handlers;
use herakles_proxy::housekeeper::{Housekeeper, HousekeeperSettings};
use herakles_proxy::poller::Poller;
use herakles_proxy::sender::{HeartbeatSender, ProxyDataSender, SenderSettings};
use herakles_proxy::state::{AppState, SharedState};
use herakles_proxy::store::Store;
use herakles_proxy::syncer::HistorySyncer;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = match config.log_level.as_deref().unwrap_or("info") {
        "off" | "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Logging initialized with level: {}", log_level);
    Ok(())
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

fn open_store(path: &Path) -> anyhow::Result<Store> {
    Store::open(path).with_context(|| format!("cannot open database {}", path.display()))
}

/// Re-reads the item list whenever a reload is requested.
async fn run_config_reloader(state: SharedState) {
    let wakeup = state.reload_wakeup.clone();
    loop {
        match wakeup.wait(&state.run, None).await {
            WakeReason::Shutdown => break,
            WakeReason::Timer | WakeReason::Triggered => {}
        }
        let _busy = wakeup.busy();
        if let Err(e) = state.reload_items() {
            error!("Configuration cache reload failed: {}", e);
        }
    }
    debug!("Configuration reloader stopped");
}

/// Routes process signals: SIGUSR1 runs the housekeeper, SIGINT and
/// SIGTERM stop the pipeline.
async fn handle_signals(state: SharedState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let housekeeping = async {
        match signal::unix::signal(signal::unix::SignalKind::user_defined1()) {
            Ok(mut sig) => {
                while sig.recv().await.is_some() {
                    info!("Received SIGUSR1, forcing housekeeper");
                    state.housekeeper_wakeup.trigger();
                }
            }
            Err(e) => warn!("Failed to install SIGUSR1 handler: {}", e),
        }
        std::future::pending::<()>().await;
    };

    #[cfg(not(unix))]
    let housekeeping = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = housekeeping => {}
    }
    state.run.shutdown();
}

/// Spawns every pipeline task. The syncer handle is returned separately
/// because shutdown waits for its final flush.
fn spawn_pipeline(state: &SharedState) -> (JoinHandle<()>, Vec<JoinHandle<()>>) {
    let settings = &state.settings;
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(run_collector(
        state.disks.clone(),
        state.run.clone(),
    )));

    let poller = Poller::new(
        state.config_cache.clone(),
        Arc::new(LocalMetricSource::new(state.disks.clone())),
        state.write_buffer.clone(),
        state.store.clone(),
        state.stats.clone(),
    );
    tasks.push(tokio::spawn(poller.run(state.run.clone())));

    let sender = ProxyDataSender::new(
        state.store.clone(),
        state.comms.clone(),
        state.stats.clone(),
        SenderSettings {
            host: settings.hostname.clone(),
            max_records: settings.proxy_data_max_records,
            max_bytes: settings.proxy_data_max_bytes,
            frequency: settings.data_sender_frequency,
            task_frequency: settings.task_frequency,
            retry_interval: settings.retry_interval,
        },
    );
    tasks.push(tokio::spawn(sender.run(state.run.clone())));

    let heartbeat = HeartbeatSender::new(
        state.comms.clone(),
        state.stats.clone(),
        &settings.hostname,
    );
    tasks.push(tokio::spawn(
        heartbeat.run(state.run.clone(), settings.heartbeat_frequency),
    ));

    let housekeeper = Housekeeper::new(
        state.store.clone(),
        state.stats.clone(),
        HousekeeperSettings {
            frequency: settings.housekeeping_frequency,
            local_buffer_secs: settings.local_buffer_secs,
            offline_buffer_secs: settings.offline_buffer_secs,
        },
        state.housekeeper_wakeup.clone(),
    );
    tasks.push(tokio::spawn(housekeeper.run(state.run.clone())));

    tasks.push(tokio::spawn(run_config_reloader(state.clone())));

    let syncer = HistorySyncer::new(
        state.write_buffer.clone(),
        state.store.clone(),
        state.value_cache.clone(),
        state.config_cache.clone(),
        state.stats.clone(),
        settings.sync_batch_size,
    );
    let syncer = tokio::spawn(syncer.run(state.run.clone(), settings.sync_delay));

    (syncer, tasks)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format);
    }

    let config = load_validated_config(&args)?;
    setup_logging(&config)?;

    info!("Starting herakles-proxy");

    let config_path = if args.no_config {
        None
    } else {
        config_file_path(args.config.as_deref().and_then(|p| p.to_str()))
    };
    let settings = config.settings();
    let store = open_store(&settings.db_path)?;

    let state: SharedState = Arc::new(AppState::build(config, config_path, store)?);
    info!(
        "Proxy \"{}\" forwarding to {}:{} ({} items configured)",
        settings.hostname,
        settings.server,
        settings.server_port,
        state.config_cache.len()
    );

    let (syncer, tasks) = spawn_pipeline(&state);
    tokio::spawn(handle_signals(state.clone()));

    // Configure HTTP server routes
    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "herakles-proxy admin listener on http://{}:{}",
        settings.bind, settings.port
    );

    let run = state.run.clone();
    let app = handlers::router(state.clone());
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { run.stopped().await })
        .await
    {
        error!("Server error: {}", e);
        state.run.shutdown();
    }

    info!("Waiting for the history syncer to flush");
    if let Err(e) = syncer.await {
        error!("History syncer terminated abnormally: {}", e);
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task terminated abnormally: {}", e);
        }
    }

    info!("herakles-proxy stopped gracefully");
    Ok(())
}
