// =============================================================================
// Market Intelligence Service -- main entry point
// =============================================================================
//
// TradingView multi-indicator aggregator: webhook ingestion, deterministic
// rules evaluation, scheduled watchlist refresh, live price streaming, and
// single-flight AI explanations coordinated through Redis.
// =============================================================================

mod aggregator;
mod ai_client;
mod api;
mod app_state;
mod dedup;
mod evaluation;
mod locks;
mod market_data;
mod normalizer;
mod price_stream;
mod publisher;
mod rules_engine;
mod runtime_config;
mod scheduler;
mod settings;
mod store;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::price_stream::spawn_price_stream;
use crate::scheduler::spawn_scheduler;
use crate::settings::Settings;
use crate::store::RedisStore;

#[tokio::main]
async fn main() -> Result<()> {
    // -- 1. Environment & logging ----------------------------------------
    let _ = dotenv::dotenv();

    let settings = Settings::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    if settings.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(env = %settings.app_env, "market-intel starting up");

    // -- 2. Store & shared state ------------------------------------------
    let store = RedisStore::connect(&settings.redis_url).await?;
    let state = Arc::new(AppState::new(settings.clone(), Arc::new(store)));

    // -- 3. Background tasks ----------------------------------------------
    let price_handle = spawn_price_stream(state.prices.clone());
    let scheduler_handle = spawn_scheduler(state.clone());

    // -- 4. API server -----------------------------------------------------
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // -- 5. Graceful shutdown ---------------------------------------------
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    price_handle.stop().await;
    scheduler_handle.stop().await;
    state.drain_background().await;

    info!("market-intel shut down complete");
    Ok(())
}
