//! Gateway process: loads config, connects the counter store, serves the limited router.

mod app;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use prometheus::Registry;
use tokio::signal;
use tollgate::{CounterStore, InMemoryCounterStore};
use tollgate_redis::RedisCounterStore;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config file. Defaults apply to anything it leaves out.
    #[arg(long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `listen` from the config file.
    #[arg(long, env = "TOLLGATE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Overrides `redis_url` from the config file.
    #[arg(long, env = "TOLLGATE_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => {
            tracing::warn!("no config file given; using default limits");
            GatewayConfig::default()
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url;
    }

    let store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCounterStore::connect(url).await?),
        None => {
            tracing::warn!(
                "no redis_url configured; limits are enforced per process, not across the fleet"
            );
            Arc::new(InMemoryCounterStore::new())
        }
    };

    let router = app::router(&config, store, Registry::new())?;
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!("tollgate gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
