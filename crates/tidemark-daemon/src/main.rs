//! Tidemark Daemon - local change detection service
//!
//! Watches one directory tree, folds OS notifications into debounced
//! changes, orders them and hands them to the dispatch worker. Runs until
//! SIGTERM or SIGINT.
//!
//! # Architecture
//!
//! The watcher is started before the initial scan so that edits made while
//! scanning stay buffered in the notification channel; the engine replays
//! them once the snapshot is loaded. This build ships no uploader: the
//! dispatch worker logs every unit and acknowledges it, and a real sync
//! engine plugs in through `IChangeSink`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tidemark_core::config::Config;
use tidemark_core::domain::{DispatchUnit, Notification};
use tidemark_core::ports::{
    IChangeSink, IEventLog, IEventReporter, IMetadataProbe, ITransferRegistry,
};
use tidemark_sync::engine::{EnginePorts, WatchEngine};
use tidemark_sync::EngineError;
use tidemark_sync::event_log::MemoryEventLog;
use tidemark_sync::filesystem::{scan_tree, LocalMetadataProbe};
use tidemark_sync::reporter::TracingReporter;
use tidemark_sync::sink::ChannelSink;
use tidemark_sync::transfers::TransferTable;
use tidemark_sync::watcher::FileWatcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Units buffered between the engine and the dispatch worker
const DISPATCH_CAPACITY: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "tidemarkd", version, about = "Local change-detection daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to watch, overriding `watch.root`
    #[arg(long)]
    root: Option<PathBuf>,
}

// ============================================================================
// DaemonService
// ============================================================================

struct DaemonService {
    config: Config,
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Scan, watch and dispatch until shutdown
    async fn run(&self) -> Result<()> {
        let watch = &self.config.watch;
        let root = tokio::fs::canonicalize(&watch.root)
            .await
            .with_context(|| format!("Failed to resolve watch root {}", watch.root.display()))?;
        info!(root = %root.display(), "Watching directory tree");

        let (sink, units) = ChannelSink::new(DISPATCH_CAPACITY);
        let ports = EnginePorts {
            probe: Arc::new(LocalMetadataProbe::new(&root)) as Arc<dyn IMetadataProbe>,
            event_log: Arc::new(MemoryEventLog::new()) as Arc<dyn IEventLog>,
            sink: Arc::new(sink) as Arc<dyn IChangeSink>,
            transfers: Arc::new(TransferTable::new()) as Arc<dyn ITransferRegistry>,
            reporter: Arc::new(TracingReporter::new()) as Arc<dyn IEventReporter>,
        };
        let engine = Arc::new(WatchEngine::new(
            &root,
            watch.debounce_settings(),
            watch.path_case(),
            ports,
        ));

        let (mut watcher, notifications) = FileWatcher::new(&root, watch.channel_capacity)?;
        watcher.watch()?;

        let snapshot = scan_tree(&root).await?;
        engine.bootstrap(snapshot, Vec::new()).await;

        let result = drive(engine, notifications, units, self.shutdown.clone()).await;

        if let Err(e) = watcher.unwatch() {
            warn!(error = %e, "Failed to stop watcher");
        }
        result.context("Watch engine failed")
    }
}

/// Run the engine next to a dispatch worker until `shutdown` fires
///
/// The worker gets its own token, cancelled once `run` has returned, so the
/// units of the final flush are still acknowledged.
async fn drive(
    engine: Arc<WatchEngine>,
    notifications: mpsc::Receiver<Notification>,
    units: mpsc::Receiver<Vec<DispatchUnit>>,
    shutdown: CancellationToken,
) -> Result<(), EngineError> {
    let worker_stop = CancellationToken::new();
    let worker = tokio::spawn(dispatch_worker(
        Arc::clone(&engine),
        units,
        worker_stop.clone(),
    ));

    let result = engine.run(notifications, shutdown).await;

    worker_stop.cancel();
    if let Err(e) = worker.await {
        warn!(error = %e, "Dispatch worker ended abnormally");
    }
    result
}

/// Logs every dispatched unit and acknowledges it
///
/// Units still queued when `stop` fires are drained before the worker exits.
async fn dispatch_worker(
    engine: Arc<WatchEngine>,
    mut units: mpsc::Receiver<Vec<DispatchUnit>>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            batch = units.recv() => match batch {
                Some(batch) => acknowledge(&engine, batch).await,
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok(batch) = units.try_recv() {
                    acknowledge(&engine, batch).await;
                }
                break;
            }
        }
    }
    info!("Dispatch worker stopped");
}

async fn acknowledge(engine: &WatchEngine, batch: Vec<DispatchUnit>) {
    for unit in batch {
        for change in unit.execution_order() {
            debug!(change = %change, origin = ?change.origin, "Dispatched change");
        }
        info!(change = %unit.change, size = unit.len(), "Unit dispatched");
        engine.report_completed(unit.change.id).await;
    }
}

// ============================================================================
// Startup helpers
// ============================================================================

/// Resolve a leading `~` against the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()),
    };
    if let Some(root) = &cli.root {
        config.watch.root = root.clone();
    }
    config.watch.root = expand_home(&config.watch.root);
    Ok(config)
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    info!("Tidemark daemon starting (tidemarkd)");

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(%e, "Invalid configuration");
        }
        anyhow::bail!("configuration has {} error(s)", errors.len());
    }

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token);
    let result = service.run().await;

    match &result {
        Ok(()) => info!("Tidemark daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Tidemark daemon exiting with error"),
    }
    result
}
