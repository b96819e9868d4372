//! Process entrypoint: wires the catalog, Feature Index,
//! latent client, and session Registry together, serves the HTTP surface,
//! and tears everything down on a terminal signal.
//!
//! Builds a `tracing_subscriber`
//! registry built before anything else (file writer layer plus a
//! broadcast-style layer for recent-log replay), `Config::load()`, then
//! components constructed in dependency order and handed to the server loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use latentradio_proto::config::Config;
use latentradio_proto::platform;
use latentradio_server::catalog::Catalog;
use latentradio_server::feature_index::FeatureIndex;
use latentradio_server::http::{self, AppState};
use latentradio_server::latent_client::LatentClient;
use latentradio_server::logs::{RecentLogs, RecentLogsLayer};
use latentradio_server::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let recent_logs = RecentLogs::new();
    init_tracing(recent_logs.clone())?;

    let config = Config::load()?;
    info!(path = ?Config::config_path(), "config loaded");

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    if let Some(running_pid) = other_instance_pid() {
        anyhow::bail!("another latentradio-server instance is already running (pid {running_pid})");
    }
    std::fs::write(platform::pid_file(), std::process::id().to_string())?;

    let catalog = match Catalog::open(&config.catalog.sqlite_path) {
        Ok(catalog) => Some(Arc::new(catalog)),
        Err(e) => {
            warn!(error = %e, "catalog unavailable, starting with an empty feature index");
            None
        }
    };

    let tracks = match &catalog {
        Some(catalog) => catalog.load_tracks(config.catalog.build_batch_size).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load tracks from catalog");
            Vec::new()
        }),
        None => Vec::new(),
    };
    info!(track_count = tracks.len(), "feature index built");
    let feature_index = Arc::new(FeatureIndex::new(tracks));

    let latent = LatentClient::spawn(config.latent.clone());

    let registry = Registry::new(
        feature_index,
        config.explorer.clone(),
        config.session.clone(),
        config.mixer.clone(),
        latent,
    );
    registry.prewarm_refill().await;
    spawn_sweep_task(registry.clone(), config.session.sweep_interval_secs);

    let state = AppState {
        registry: registry.clone(),
        catalog,
        config: config.clone(),
        recent_logs,
        started_at: std::time::Instant::now(),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let app = http::router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    registry.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(recent_logs: Arc<RecentLogs>) -> anyhow::Result<()> {
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(platform::default_log_path())?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(log_file).with_ansi(false);
    let recent_layer = RecentLogsLayer::new(recent_logs);
    let filter = tracing_subscriber::EnvFilter::try_from_env(platform::ENV_LOG)
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,latentradio_server=debug"));

    tracing_subscriber::registry().with(fmt_layer).with(recent_layer).with(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            return;
        };
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

/// Returns the pid recorded in the pid file if it still names a live
/// process, so `main` can refuse to start a second instance on the same
/// host. A pid file left behind by a process that no longer exists is
/// treated as stale and silently reclaimed.
fn other_instance_pid() -> Option<u32> {
    let contents = std::fs::read_to_string(platform::pid_file()).ok()?;
    let pid: u32 = contents.trim().parse().ok()?;

    #[cfg(unix)]
    {
        if std::path::Path::new(&format!("/proc/{pid}")).exists() {
            Some(pid)
        } else {
            None
        }
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn spawn_sweep_task(registry: Arc<Registry>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            registry.sweep(|id| info!(session_id = %id, "idle session reaped")).await;
        }
    });
}
