//! fprintd - fingerprint reader brokerage daemon.
//!
//! Starts the print store from configuration, enumerates devices, serves
//! the control socket, and coordinates sleep transitions. Exits 0 on a
//! clean shutdown (SIGTERM or idle timeout), 1 on a fatal startup error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fprintd_core::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use fprintd_core::proto::DEFAULT_SOCKET_PATH;
use fprintd_core::store::create_store;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fprintd_daemon::manager::{Manager, StaticHost, DEFAULT_IDLE_TIMEOUT};
use fprintd_daemon::policy::{LocalPolicy, PolicyGate};
use fprintd_daemon::server::{ConnectionRegistry, Server};
use fprintd_daemon::suspend::{ChannelSleepMonitor, SuspendCoordinator};

/// Fingerprint handler daemon.
#[derive(Parser, Debug)]
#[command(name = "fprintd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the control socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Override the print storage root
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Do not exit after being unused for a while
    #[arg(long, short = 't')]
    no_timeout: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    // The state machine relies on a single cooperative loop; every device
    // transition is serialized on it.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("fprintd: {err:#}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fprintd: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&args.config).context("failed to load configuration")?;
    debug!(?config, "configuration loaded");

    let state_dir = args
        .state_dir
        .clone()
        .or_else(|| config.storage.state_dir.clone());
    let store = create_store(&config.storage.backend, state_dir)
        .context("failed to create print store")?;
    store.init().context("failed to initialize print store")?;

    let idle_timeout = if args.no_timeout {
        None
    } else {
        Some(DEFAULT_IDLE_TIMEOUT)
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let gate = PolicyGate::new(Arc::new(LocalPolicy));
    let manager = Manager::new(
        Arc::clone(&store),
        gate,
        Arc::clone(&registry) as _,
        idle_timeout,
    );

    // Device enumeration blocks before the socket is published so early
    // clients see the full device set. The hardware context is an external
    // collaborator; without one the daemon serves an empty reader set.
    let host = StaticHost::new(Vec::new());
    let manager_run = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(host).await })
    };

    let coordinator = SuspendCoordinator::new(Arc::clone(&manager));
    let (_sleep_tx, sleep_monitor) = ChannelSleepMonitor::new();
    let suspend_run = tokio::spawn(async move { coordinator.run(sleep_monitor).await });

    let server = Arc::new(Server::new(
        Arc::clone(&manager),
        registry,
        args.socket.clone(),
    ));
    let server_run = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    let mut shutdown = manager.shutdown_watch();

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            manager.request_shutdown();
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down");
            manager.request_shutdown();
        }
        changed = shutdown.changed() => {
            if changed.is_ok() {
                info!("idle timeout reached, shutting down");
            }
        }
    }

    // Graceful drain: in-flight operations finish, new ones are refused.
    manager.drain().await;
    store.deinit();

    server_run.abort();
    suspend_run.abort();
    manager_run.abort();

    if let Err(err) = std::fs::remove_file(&args.socket) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove control socket: {err}");
        }
    }

    Ok(())
}
