// =============================================================================
// B-Book Engine: Main Entry Point
// =============================================================================
//
// Quotes flow from the price feed onto the event bus, into the instrument
// store and candle builder, and from there into the trade engine's SL/TP and
// pending-order sweeps. The HTTP API exposes the engine's operations and
// streams bus events over a websocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod calc;
mod error;
mod events;
mod market_data;
mod runtime_config;
mod trading;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::events::EventKind;
use crate::runtime_config::{FeedMode, RuntimeConfig};
use crate::trading::monitor::{run_price_driven_sweeps, run_sweep_monitor};
use crate::trading::MemoryRepository;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("B-Book Engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides(|key| std::env::var(key).ok());

    info!(
        symbols = ?config.symbols,
        feed_mode = %config.feed_mode,
        bind_addr = %config.bind_addr,
        "Configuration loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, Arc::new(MemoryRepository::new()))?);

    // ── 3. Price feed ────────────────────────────────────────────────────
    let (feed_mode, feed_url, static_prices, static_tick) = {
        let config = state.runtime_config.read();
        (
            config.feed_mode,
            config.feed_url.clone(),
            config.static_prices.clone(),
            config.static_tick(),
        )
    };

    let feed_state = state.clone();
    match feed_mode {
        FeedMode::Static => {
            tokio::spawn(async move {
                feed_state
                    .feed
                    .run_static(static_prices, static_tick, &*feed_state)
                    .await;
            });
        }
        FeedMode::Live => {
            tokio::spawn(async move {
                loop {
                    match feed_state.feed.run_live(&feed_url, &*feed_state).await {
                        // Symbol set changed; reconnect straight away.
                        Ok(()) => continue,
                        Err(e) => {
                            error!(error = %e, "Price stream error — reconnecting in 5s");
                        }
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            });
        }
    }

    info!(mode = %feed_mode, "Price feed launched");

    // ── 4. Sweeps ────────────────────────────────────────────────────────
    tokio::spawn(run_sweep_monitor(state.clone()));

    if state.runtime_config.read().event_driven_sweeps {
        let updates = state.bus.subscribe(EventKind::PriceUpdate);
        tokio::spawn(run_price_driven_sweeps(state.engine.clone(), updates));
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("B-Book Engine shut down complete.");
    Ok(())
}
