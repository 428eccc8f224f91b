// =============================================================================
// Central application state -- shared across all async tasks via Arc
// =============================================================================
//
// Thread safety:
//   - The keyed store and price map manage their own interior mutability.
//   - The background JoinSet sits behind a parking_lot::Mutex; finished
//     tasks are reaped opportunistically on each spawn.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::ai_client::AiClient;
use crate::market_data::MarketDataClient;
use crate::price_stream::PriceMap;
use crate::settings::Settings;
use crate::store::KeyedStore;

/// Process-wide shared state.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn KeyedStore>,
    pub ai: AiClient,
    pub market: MarketDataClient,
    pub prices: Arc<PriceMap>,

    /// Background evaluations spawned by the webhook path. Bounded to the
    /// process lifetime: whatever is still running at shutdown is aborted,
    /// which is safe because its only external effect is a monotonic
    /// `store_latest` write.
    background: Mutex<JoinSet<()>>,

    start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, store: Arc<dyn KeyedStore>) -> Self {
        let ai = AiClient::from_settings(&settings);
        Self {
            settings,
            store,
            ai,
            market: MarketDataClient::new(),
            prices: Arc::new(PriceMap::new()),
            background: Mutex::new(JoinSet::new()),
            start_time: Instant::now(),
        }
    }

    /// Spawn a fire-and-forget background task tied to the process lifetime.
    pub fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.background.lock();
        // Reap whatever has already finished so the set stays small.
        while set.try_join_next().is_some() {}
        set.spawn(fut);
    }

    /// Abort and await all remaining background tasks (shutdown path).
    pub async fn drain_background(&self) {
        let mut set = std::mem::take(&mut *self.background.lock());
        set.shutdown().await;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
