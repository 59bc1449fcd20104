mod api;
mod auth;
mod config;
mod error;
mod rate_limit;
mod repo;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use kindred_coordinator::Coordinator;
use kindred_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::repo::SqliteRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kindred_server=debug")),
        )
        .init();

    info!("Starting Kindred server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        tick_interval = ?config.coordinator.tick_interval,
        ballot_ttl = ?config.coordinator.ballot_ttl,
        "Loaded configuration"
    );
    if config.jwt_secret == ServerConfig::default().jwt_secret {
        tracing::warn!("KINDRED_JWT_SECRET not set, using the development secret");
    }

    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::open_in_memory()?,
    };
    let repo = SqliteRepository::new(database);

    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone(), repo.clone()));
    coordinator.start();

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let ws_limiter = RateLimiter::new(config.ws_frames_per_sec, config.ws_frame_burst);

    // Rate limiter cleanup every 5 min, evict buckets idle >10 min
    let rl = rate_limiter.clone();
    let wl = ws_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
            wl.purge_stale(600.0).await;
        }
    });

    let http_addr = config.http_addr;
    let app_state = AppState {
        config: Arc::new(config),
        repo,
        coordinator: coordinator.clone(),
        rate_limiter,
        ws_limiter,
    };

    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                coordinator.stop();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    coordinator.stop();
    Ok(())
}
