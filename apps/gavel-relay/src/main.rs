mod config;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use notify_bus::{EventBus, LocalBus, RedisBus};
use notify_core::{BusBridge, ConnectionRegistry, NotifyService};
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, RelayConfig};
use crate::routes::build_router;
use crate::state::AppState;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        bus = config.redis_url.as_deref().unwrap_or("in-memory"),
        queue_capacity = config.queue_capacity,
        replay_capacity = config.replay_capacity,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting gavel-relay"
    );

    run(config).await
}

async fn run(config: RelayConfig) -> Result<()> {
    let bus: Arc<dyn EventBus> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(
            RedisBus::connect(
                url,
                &config.bus_channel,
                config.replay_capacity,
                config.replay_ttl,
            )
            .await
            .context("failed to connect to redis bus")?,
        ),
        None => {
            warn!("no redis url configured; using the in-memory bus (single instance only)");
            Arc::new(LocalBus::with_limits(
                config.replay_capacity,
                config.replay_ttl,
            ))
        }
    };

    let registry = ConnectionRegistry::new(config.idle_timeout);
    let bridge = Arc::new(BusBridge::new(bus.clone(), registry.clone()));
    bridge.start().await.context("failed to start bus bridge")?;
    let sweeper = registry.spawn_idle_sweeper(config.sweep_interval);

    let service = NotifyService::new(
        bus,
        registry.clone(),
        bridge.clone(),
        config.queue_capacity,
    );
    let state = AppState {
        service,
        keep_alive: config.keep_alive,
    };
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("gavel-relay listening on {}", config.listen_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    // SSE responses never finish on their own, so graceful shutdown
    // would wait forever on a single connected client. After the grace
    // period, drain the registry: dropping the senders ends the open
    // streams and lets serve finish.
    let drainer = {
        let registry = registry.clone();
        let mut shutdown = shutdown_rx.clone();
        let grace = config.shutdown_grace;
        tokio::spawn(async move {
            if shutdown.changed().await.is_err() {
                return;
            }
            tokio::time::sleep(grace).await;
            let closed = registry.drain();
            if closed > 0 {
                info!(closed, "open connections drained after shutdown grace");
            }
        })
    };

    let mut serve_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await
        .context("server shutdown with error")?;

    drainer.abort();
    bridge.stop().await;
    sweeper.abort();
    info!("graceful shutdown complete");
    Ok(())
}
