// =============================================================================
// Refresh Scheduler -- keeps watchlist evaluations fresh without webhooks
// =============================================================================
//
// One long-running task. Each iteration reloads the runtime config, ticks
// every watchlist symbol (aggregate -> rules -> market -> publish), and
// every `ai_every` ticks per symbol also refreshes the AI layer under the
// single-flight lock. A busy lock is skipped; the symbol's counter resets
// anyway so AI cadence does not starve behind webhook-driven runs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::aggregator::aggregate;
use crate::app_state::AppState;
use crate::locks::{acquire_ai_lock, release_ai_lock};
use crate::publisher::store_latest;
use crate::rules_engine::evaluate;
use crate::runtime_config::RuntimeConfig;

/// Floor on the loop interval regardless of config.
const MIN_INTERVAL_SECS: u64 = 5;

/// Handle to the running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the task to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the scheduler task.
pub fn spawn_scheduler(state: Arc<AppState>) -> SchedulerHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_loop(state, shutdown_rx));
    SchedulerHandle { shutdown, task }
}

/// Effective loop interval and AI cadence (in ticks) for a config.
pub fn cadence(config: &RuntimeConfig) -> (u64, u64) {
    let interval = config.refresh_rules_seconds.max(MIN_INTERVAL_SECS);
    let ai_every = (config.refresh_ai_seconds / interval).max(1);
    (interval, ai_every)
}

/// Advance a symbol's tick counter; returns the stored counter and whether
/// this tick must refresh the AI layer.
pub fn advance_counter(count: u64, ai_every: u64) -> (u64, bool) {
    let next = count + 1;
    if next >= ai_every {
        (0, true)
    } else {
        (next, false)
    }
}

async fn run_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    info!("scheduler started");
    // symbol -> ticks since the last AI refresh
    let mut tick_counters: HashMap<String, u64> = HashMap::new();

    loop {
        let config = match RuntimeConfig::load(state.store.as_ref()).await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "scheduler config load failed");
                RuntimeConfig::default()
            }
        };

        let (interval, ai_every) = cadence(&config);

        for symbol in &config.watchlist_symbols {
            let count = tick_counters.get(symbol).copied().unwrap_or(0);
            let (next, force_ai) = advance_counter(count, ai_every);
            tick_counters.insert(symbol.clone(), next);

            tick(&state, symbol, force_ai).await;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }

    info!("scheduler stopped");
}

/// Single refresh tick for one symbol. Errors are logged and swallowed; the
/// next iteration retries.
pub async fn tick(state: &AppState, symbol: &str, force_ai: bool) {
    if let Err(e) = try_tick(state, symbol, force_ai).await {
        error!(symbol, error = %e, "scheduler tick error");
    }
}

async fn try_tick(state: &AppState, symbol: &str, force_ai: bool) -> Result<()> {
    let store = state.store.as_ref();
    let config = RuntimeConfig::load(store).await?;

    let aggregation = aggregate(store, symbol, &config, config.events_max_per_symbol).await?;
    let rules = evaluate(&aggregation, &config);

    let market = state.market.get_market_summaries(symbol).await;

    let mut ai_text = None;
    if force_ai {
        match acquire_ai_lock(store, symbol).await? {
            Some(token) => {
                ai_text = Some(state.ai.explain(&rules, &aggregation, &market).await);
                release_ai_lock(store, symbol, &token).await?;
            }
            None => debug!(symbol, "scheduler ai lock busy, skipping"),
        }
    }

    store_latest(
        store,
        symbol,
        &rules,
        &aggregation,
        Some(&market),
        ai_text.as_deref(),
    )
    .await?;

    debug!(symbol, decision = %rules.decision, ai = force_ai, "scheduler tick");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_floors_interval_at_five_seconds() {
        let mut config = RuntimeConfig::default();
        config.refresh_rules_seconds = 1;
        config.refresh_ai_seconds = 120;
        let (interval, ai_every) = cadence(&config);
        assert_eq!(interval, 5);
        assert_eq!(ai_every, 24);
    }

    #[test]
    fn cadence_defaults_give_ai_every_four_ticks() {
        let (interval, ai_every) = cadence(&RuntimeConfig::default());
        assert_eq!(interval, 30);
        assert_eq!(ai_every, 4);
    }

    #[test]
    fn ai_every_never_drops_below_one() {
        let mut config = RuntimeConfig::default();
        config.refresh_rules_seconds = 300;
        config.refresh_ai_seconds = 60;
        let (_, ai_every) = cadence(&config);
        assert_eq!(ai_every, 1);
    }

    #[test]
    fn counter_forces_ai_on_cadence_and_resets() {
        let ai_every = 3;
        let mut count = 0;
        let mut forced = Vec::new();
        for _ in 0..7 {
            let (next, force_ai) = advance_counter(count, ai_every);
            forced.push(force_ai);
            count = next;
        }
        assert_eq!(forced, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn counter_with_cadence_one_fires_every_tick() {
        let (next, force_ai) = advance_counter(0, 1);
        assert!(force_ai);
        assert_eq!(next, 0);
    }
}
