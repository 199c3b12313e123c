use anyhow::Result;
use clap::Parser;
use liveswap::load_config;
use liveswap_api::AppState;
use liveswap_control::{FeedPoller, HttpManifestSource, UpdateOrchestrator, UpdateStore};
use liveswap_metrics::{MetricsService, TracingService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "liveswap-server")]
#[command(about = "Self-update service for a live application tree")]
struct Args {
    /// Config file; defaults to configs/default.toml or config/config.toml
    #[arg(long, env = "LIVESWAP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    TracingService::init().map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    info!("Starting liveswap server");

    let config = load_config(args.config.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    // SQLite needs the data directory before the pool connects
    if !config.data.dir.is_empty() {
        std::fs::create_dir_all(&config.data.dir)?;
    }

    let store = UpdateStore::open(&config.data.db_url).await?;
    info!("Database connected");

    let metrics = Arc::new(MetricsService::new()?);

    let mut orchestrator = UpdateOrchestrator::new(config.clone(), store, metrics.clone()).await?;
    if let Some(url) = &config.feed.manifest_url {
        info!("Using manifest feed {}", url);
        let feed = HttpManifestSource::new(url.clone(), &config.fetch)?;
        orchestrator = orchestrator.with_feed(Arc::new(feed));
    }
    let orchestrator = Arc::new(orchestrator);

    let status = orchestrator.recover().await?;
    info!(
        state = status.state.as_str(),
        active = ?status.active_version,
        halted = status.halted,
        "Startup recovery complete"
    );

    if config.feed.check_on_startup && orchestrator.has_feed() {
        match orchestrator.poll_feed().await {
            Ok(Some(outcome)) => info!("Startup feed check: {:?}", outcome.status().state),
            Ok(None) => info!("Startup feed check: nothing newer to install"),
            Err(e) => warn!("Startup feed check failed: {}", e),
        }
    }

    let poller_handle = match (config.feed.poll_interval_secs, orchestrator.has_feed()) {
        (Some(secs), true) => {
            let poller = FeedPoller::new(orchestrator.clone(), Duration::from_secs(secs));
            Some(tokio::spawn(async move { poller.start().await }))
        }
        (Some(_), false) => {
            warn!("feed.poll_interval_secs is set but feed.manifest_url is not; polling disabled");
            None
        }
        _ => None,
    };

    let bind = config.server.bind.clone();
    let port = config.server.port_admin_api;
    let api_handle = {
        let state = AppState::new(orchestrator.clone(), metrics.clone());
        let bind = bind.clone();
        tokio::spawn(async move {
            if let Err(e) = liveswap_api::start_server(bind, port, state).await {
                error!("Admin API server error: {}", e);
            }
        })
    };

    info!("liveswap server started. Admin API: {}:{}", bind, port);

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => warn!("Unable to listen for shutdown signal: {}", err),
    }

    info!("Shutting down liveswap server...");

    // Cancels any running cycle; staging left behind is swept on next start
    orchestrator.shutdown();
    api_handle.abort();
    if let Some(handle) = poller_handle {
        handle.abort();
    }

    info!("liveswap server shutdown complete");
    Ok(())
}
