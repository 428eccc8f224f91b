// =============================================================================
// Live price stream -- Binance Futures !miniTicker@arr WebSocket client
// =============================================================================
//
// Keeps an in-memory map of last prices for every symbol the exchange
// publishes. Reconnects with a fixed 3 second backoff and stops promptly
// when the lifecycle manager signals shutdown.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

const BINANCE_WS_URL: &str = "wss://fstream.binance.com/ws/!miniTicker@arr";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// =============================================================================
// Shared price map
// =============================================================================

/// Last seen price per symbol, shared between the stream task and readers.
#[derive(Default)]
pub struct PriceMap {
    prices: RwLock<HashMap<String, f64>>,
}

impl PriceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest price for `symbol`, or `None` when nothing has arrived yet.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(&symbol.to_uppercase()).copied()
    }

    /// Snapshot of all live prices.
    pub fn all(&self) -> HashMap<String, f64> {
        self.prices.read().clone()
    }

    pub fn update(&self, symbol: String, price: f64) {
        self.prices.write().insert(symbol, price);
    }
}

// =============================================================================
// Stream task
// =============================================================================

/// Handle to the running price stream task.
pub struct PriceStreamHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PriceStreamHandle {
    /// Signal shutdown and wait for the task to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the price stream task feeding `prices`.
pub fn spawn_price_stream(prices: Arc<PriceMap>) -> PriceStreamHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(stream_loop(prices, shutdown_rx));
    PriceStreamHandle { shutdown, task }
}

async fn stream_loop(prices: Arc<PriceMap>, mut shutdown: watch::Receiver<bool>) {
    info!("price stream started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = run_stream(&prices) => {
                match result {
                    Ok(()) => warn!("price stream ended, reconnecting"),
                    Err(e) => warn!(error = %e, "price stream disconnected, reconnecting"),
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    info!("price stream stopped");
}

/// Connect once and feed ticker updates into the map until the connection
/// drops.
async fn run_stream(prices: &PriceMap) -> Result<()> {
    let (ws_stream, _response) = connect_async(BINANCE_WS_URL)
        .await
        .context("failed to connect to price WebSocket")?;

    info!("price stream connected");
    let (_write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        let message = message.context("price WebSocket read error")?;
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            apply_tickers(prices, &text);
        }
        // Ping/Pong/Binary/Close frames need no handling here; tungstenite
        // answers pings automatically.
    }

    Ok(())
}

/// Parse a `!miniTicker@arr` frame and fold it into the price map. Malformed
/// frames are dropped.
fn apply_tickers(prices: &PriceMap, text: &str) {
    let Ok(tickers) = serde_json::from_str::<Vec<serde_json::Value>>(text) else {
        return;
    };

    for ticker in tickers {
        let Some(symbol) = ticker.get("s").and_then(|v| v.as_str()) else {
            continue;
        };
        // Close price arrives as a string.
        let price = match ticker.get("c") {
            Some(serde_json::Value::String(s)) => s.parse::<f64>().ok(),
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        if let Some(price) = price {
            prices.update(symbol.to_string(), price);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
