//! fermbridge: relay serial BrewPi controllers to a Fermentrack server

use anyhow::{Context, Result};
use clap::Parser;
use fermbridge_core::api::FermentrackClient;
use fermbridge_core::config::ConfigDir;
use fermbridge_core::supervisor::{RosterWatcher, Supervisor, SupervisorSettings};
use fermbridge_core::worker::{DeviceWorkerSpawner, SerialTransportFactory, WorkerContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BUILD_ID: &str = env!("FERMBRIDGE_BUILD_ID");

#[derive(Parser, Debug)]
#[command(name = "fermbridge", version = BUILD_ID, about)]
struct Cli {
    /// Directory holding app_config.json and the per-device configs
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Restart a worker whose last heartbeat is older than this
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    watchdog_timeout_secs: u64,
}

/// Filter precedence: RUST_LOG, then `--verbose`, then the configured level
fn log_filter(verbose: bool, configured: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { configured };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(verbose: bool, configured: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, configured))
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = ConfigDir::discover(cli.config_dir.clone());

    let app = match store.load_app_config() {
        Ok(app) => app,
        Err(e) => {
            init_logging(cli.verbose, "info");
            error!("{}", e);
            return Err(e).context("cannot start without a valid application config");
        }
    };
    init_logging(cli.verbose, &app.log_level);
    info!(
        build = BUILD_ID,
        config_dir = %store.path().display(),
        server = %app.api_base_url(),
        "fermbridge starting"
    );

    let api = FermentrackClient::new(app.api_base_url(), app.api_timeout());
    let ctx = Arc::new(WorkerContext::new(
        app,
        Arc::new(api),
        Arc::new(SerialTransportFactory),
        Some(store.clone()),
    ));
    let settings = SupervisorSettings {
        stale_after: Duration::from_secs(cli.watchdog_timeout_secs.max(1)),
        ..SupervisorSettings::default()
    };
    let supervisor = Supervisor::new(Arc::new(DeviceWorkerSpawner::new(ctx)), settings);

    let roster = match RosterWatcher::new(store.path()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(
                "cannot watch {} ({}); relying on periodic rescans",
                store.path().display(),
                e
            );
            None
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    supervisor.run(&store, roster, cancel).await;
    info!("fermbridge stopped");
    Ok(())
}
