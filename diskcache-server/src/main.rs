use std::net::SocketAddr;
use std::sync::Arc;

use diskcache_core::{Cache, CacheConfig};
use diskcache_server::routes;
use diskcache_server::state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config = CacheConfig::from_env()?;
    info!(
        directory = %config.directory.display(),
        size_limit = config.size_limit,
        eviction_policy = %config.eviction_policy,
        "diskcache-server starting"
    );

    let cache = Arc::new(Cache::open(config)?);
    let state = Arc::new(AppState::new(Arc::clone(&cache))?);

    let app = routes::build_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match Arc::try_unwrap(cache) {
        Ok(cache) => {
            cache.close()?;
            info!("index closed cleanly");
        }
        Err(_) => {
            tracing::warn!("cache still has outstanding references at shutdown; skipping clean close");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
