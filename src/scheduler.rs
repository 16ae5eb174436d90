// =============================================================================
// Scheduler — the control loop that drives every tick
// =============================================================================
//
// One logical controller, ticking at `trading.loop_interval_ms`. Each tick
// runs the six stages in the fixed order the control plane assumes:
//
//   1. Reconcile positions (C5) and refresh the account snapshot.
//   2. Refresh ATR/volatility classes for every active symbol (C6).
//   3. Refresh indicator snapshots for every active symbol (C4).
//   4. Evaluate the risk pipeline in priority order (C9).
//   5. Sweep trailing stops for every live position (C7).
//   6. Evaluate every live, non-completed group for a scaling transition (C8).
//
// New-order issuance from the scaling strategy passes through one choke
// point: `RiskPipeline::veto_open` → `PositionStore::can_open` →
// `BrokerGateway::market_order`. No other path submits an order.
//
// Shutdown is cooperative: a cancellation flag is checked at every stage
// boundary and before every broker call `Scheduler` itself makes directly;
// in-flight background refreshers are aborted and given a grace period to
// unwind before the process exits.
//
// Grounded in the starting crate's `main.rs` orchestration (multiple
// `tokio::spawn`'d loops, each owning a shared state handle, `interval`-
// driven ticking, `ctrl_c` for shutdown) and `exit::monitor::run_exit_monitor`'s
// collect-then-act-outside-lock shape, generalized into one struct that owns
// the tick loop plus the background refreshers it starts and stops.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerGateway;
use crate::config::EngineConfig;
use crate::engine_state::{build_snapshot, EngineSnapshot, ErrorLog};
use crate::event_bus::{Event, EventBus};
use crate::indicators::IndicatorEngine;
use crate::market_data::{MarketDataCache, SeriesKey};
use crate::position_store::PositionStore;
use crate::risk::RiskPipeline;
use crate::scaling::ScalingStrategy;
use crate::trailing::TrailingManager;
use crate::types::{IndicatorSnapshot, Side, Symbol};
use crate::volatility::VolatilityManager;

/// Shared shutdown flag. Cloned into every background task; checked at every
/// stage boundary of the main tick loop and before any broker call those
/// tasks make on their own cadence.
#[derive(Clone)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the control loop needs each tick, owned by the scheduler and
/// shared (via `Arc`) with its background refreshers.
pub struct Scheduler {
    gateway: Arc<BrokerGateway>,
    store: Arc<PositionStore>,
    cache: Arc<MarketDataCache>,
    indicators: Arc<IndicatorEngine>,
    volatility: Arc<VolatilityManager>,
    trailing: Arc<TrailingManager>,
    scaling: Arc<ScalingStrategy>,
    risk: Arc<RiskPipeline>,
    events: EventBus,
    errors: Arc<ErrorLog>,
    symbols: HashMap<String, Symbol>,
    config: EngineConfig,
    shutdown: ShutdownSignal,
    refreshers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<BrokerGateway>,
        store: Arc<PositionStore>,
        cache: Arc<MarketDataCache>,
        indicators: Arc<IndicatorEngine>,
        volatility: Arc<VolatilityManager>,
        trailing: Arc<TrailingManager>,
        scaling: Arc<ScalingStrategy>,
        risk: Arc<RiskPipeline>,
        events: EventBus,
        errors: Arc<ErrorLog>,
        symbols: HashMap<String, Symbol>,
        config: EngineConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            gateway,
            store,
            cache,
            indicators,
            volatility,
            trailing,
            scaling,
            risk,
            events,
            errors,
            symbols,
            config,
            shutdown,
            refreshers: Vec::new(),
        }
    }

    fn report_error(&self, source: &str, message: impl Into<String>) {
        let message = message.into();
        self.errors.push_with_code(message.clone(), Some(source.to_string()));
        self.events.publish(Event::Error {
            source: source.to_string(),
            message,
        });
    }

    /// Spawn the background refreshers that keep the market data cache warm
    /// between ticks: one tick poller per configured symbol, one OHLC poller
    /// per (symbol, timeframe). Each respects the shutdown signal and skips a
    /// key the on-demand path is already refreshing.
    fn spawn_background_refreshers(&mut self) {
        let tick_interval = Duration::from_millis(self.config.market_data.update_interval_ms);
        let ohlc_interval = Duration::from_millis(self.config.market_data.ohlc_update_interval_ms);

        for symbol in self.symbols.keys().cloned() {
            let cache = Arc::clone(&self.cache);
            let shutdown = self.shutdown.clone();
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let handle = tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    if cache.tick_in_flight(&symbol) {
                        continue;
                    }
                    if let Err(e) = cache.refresh_tick(&symbol).await {
                        warn!(symbol, error = %e, "background tick refresh failed");
                    }
                }
            });
            self.refreshers.push(handle);
        }

        for symbol in self.symbols.keys().cloned() {
            for timeframe in self.config.market_data.timeframes.clone() {
                let cache = Arc::clone(&self.cache);
                let shutdown = self.shutdown.clone();
                let key = SeriesKey {
                    symbol: symbol.clone(),
                    timeframe: timeframe.clone(),
                };
                let mut ticker = interval(ohlc_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let handle = tokio::spawn(async move {
                    loop {
                        ticker.tick().await;
                        if shutdown.is_cancelled() {
                            break;
                        }
                        if cache.ohlc_in_flight(&key) {
                            continue;
                        }
                        if let Err(e) = cache.refresh_ohlc(&key).await {
                            warn!(key = %key, error = %e, "background ohlc refresh failed");
                        }
                    }
                });
                self.refreshers.push(handle);
            }
        }

        info!(count = self.refreshers.len(), "background refreshers started");
    }

    /// A minimal trend-following entry signal used only to decide which
    /// side to open a brand-new scaling group on. Not part of the indicator
    /// engine's own output (`IndicatorSnapshot` has no opinion on direction)
    /// and deliberately far simpler than the starting crate's weighted
    /// ensemble scorer: price above/below its own EMA, tie-broken by RSI.
    fn entry_side(snapshot: &IndicatorSnapshot) -> Option<Side> {
        match (snapshot.price, snapshot.ema) {
            (Some(price), Some(ema)) if price > ema => Some(Side::Buy),
            (Some(price), Some(ema)) if price < ema => Some(Side::Sell),
            _ => match snapshot.rsi {
                Some(rsi) if rsi < 30.0 => Some(Side::Buy),
                Some(rsi) if rsi > 70.0 => Some(Side::Sell),
                _ => None,
            },
        }
    }

    /// Ensure every configured trading symbol has at least one active
    /// (non-completed) scaling group, creating one from the entry signal
    /// above if none exists yet. A symbol with no directional signal this
    /// tick is simply left without a group until one emerges.
    async fn ensure_groups(&self) -> Vec<uuid::Uuid> {
        let mut group_ids = Vec::new();
        let timeframe = &self.config.indicators.timeframe;

        for symbol_name in self.symbols.keys() {
            let has_active_group = self
                .store
                .groups_for_symbol(symbol_name)
                .iter()
                .any(|g| !g.completed);
            if has_active_group {
                continue;
            }

            let snapshot = match self.indicators.snapshot(symbol_name, timeframe).await {
                Ok(s) => s,
                Err(e) => {
                    self.report_error("scheduler.indicators", format!("snapshot failed for {symbol_name}: {e}"));
                    continue;
                }
            };

            let Some(side) = Self::entry_side(&snapshot) else {
                continue;
            };
            let Some(price) = snapshot.price else {
                continue;
            };

            let group_id = self.store.create_group(symbol_name.clone(), side, price);
            info!(symbol = %symbol_name, %group_id, ?side, price, "scaling group created");
        }

        for symbol_name in self.symbols.keys() {
            group_ids.extend(
                self.store
                    .groups_for_symbol(symbol_name)
                    .iter()
                    .filter(|g| !g.completed)
                    .map(|g| g.id),
            );
        }
        group_ids
    }

    async fn run_tick(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 1. Reconcile positions, refresh account -------------------------
        if let Err(e) = self.store.reconcile().await {
            self.report_error("scheduler.reconcile", format!("reconcile failed: {e}"));
            return;
        }
        let account = match self.gateway.get_account_info().await {
            Ok(a) => a,
            Err(e) => {
                self.report_error("scheduler.account", format!("account refresh failed: {e}"));
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 2. Refresh ATR/volatility classes --------------------------------
        let timeframe = self.config.indicators.timeframe.clone();
        let atr_period = self.config.indicators.atr_period as u32;
        for symbol_name in self.symbols.keys() {
            if let Err(e) = self.volatility.refresh(symbol_name, &timeframe, atr_period).await {
                self.report_error("scheduler.volatility", format!("volatility refresh failed for {symbol_name}: {e}"));
            }
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 3. Refresh indicator snapshots -----------------------------------
        for symbol_name in self.symbols.keys() {
            if let Err(e) = self.indicators.snapshot(symbol_name, &timeframe).await {
                self.report_error("scheduler.indicators", format!("indicator refresh failed for {symbol_name}: {e}"));
            }
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 4. Risk pipeline, highest priority first -------------------------
        let results = self.risk.evaluate(&account, &self.store).await;
        for (name, outcome) in results {
            if let Err(e) = outcome {
                self.report_error("scheduler.risk", format!("handler '{name}' failed: {e}"));
            }
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 5. Trailing sweep --------------------------------------------------
        if let Err(e) = self.trailing.sweep().await {
            self.report_error("scheduler.trailing", format!("trailing sweep failed: {e}"));
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        // -- 6. Scaling evaluation, one transition per group per tick ---------
        let group_ids = self.ensure_groups().await;
        for group_id in group_ids {
            if self.shutdown.is_cancelled() {
                break;
            }

            let positions = self.store.positions();
            let Some(group) = self.store.group(group_id) else {
                continue;
            };
            if !self
                .risk
                .veto_open(&account, &positions, &group.symbol, self.config.scaling.base_volume, None, None)
            {
                debug!(%group_id, "scaling evaluation skipped: vetoed by risk pipeline");
                continue;
            }

            if let Err(e) = self.scaling.evaluate_group(group_id).await {
                self.report_error("scheduler.scaling", format!("group {group_id} evaluation failed: {e}"));
            }
        }
    }

    /// Run the tick loop until the shutdown signal is set. Spawns the
    /// background refreshers first so the cache is warm before the first
    /// tick runs.
    pub async fn run(&mut self) {
        self.spawn_background_refreshers();

        let mut ticker = interval(Duration::from_millis(self.config.trading.loop_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.config.trading.loop_interval_ms, "scheduler started");

        while !self.shutdown.is_cancelled() {
            ticker.tick().await;
            if self.shutdown.is_cancelled() {
                break;
            }
            self.run_tick().await;
        }

        self.shutdown_gracefully().await;
    }

    /// Cancel every background refresher and wait up to a grace period for
    /// them to unwind. Overrunning tasks are abandoned; their results, if
    /// any, are discarded.
    async fn shutdown_gracefully(&mut self) {
        info!("scheduler shutting down, cancelling background refreshers");
        self.shutdown.cancel();

        let grace = Duration::from_secs(5);
        let handles = std::mem::take(&mut self.refreshers);
        let joined = tokio::time::timeout(grace, futures_join_all(handles)).await;
        if joined.is_err() {
            warn!("background refreshers did not unwind within the grace period, abandoning them");
        }
        info!("scheduler shutdown complete");
    }

    pub fn snapshot(&self, account: crate::types::AccountSnapshot) -> EngineSnapshot {
        build_snapshot(account, &self.store, &self.errors)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }
}

/// Small local stand-in for `futures::future::join_all` so this crate does
/// not need to pull in `futures-util` just to await a `Vec<JoinHandle<_>>>`.
async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "background refresher task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_side_prefers_price_vs_ema_over_rsi() {
        let snapshot = IndicatorSnapshot {
            price: Some(1.2010),
            ema: Some(1.2000),
            rsi: Some(50.0),
            ..Default::default()
        };
        assert_eq!(Scheduler::entry_side(&snapshot), Some(Side::Buy));
    }

    #[test]
    fn entry_side_falls_back_to_rsi_without_ema() {
        let snapshot = IndicatorSnapshot {
            price: Some(1.2010),
            ema: None,
            rsi: Some(25.0),
            ..Default::default()
        };
        assert_eq!(Scheduler::entry_side(&snapshot), Some(Side::Buy));
    }

    #[test]
    fn entry_side_is_none_without_enough_data() {
        let snapshot = IndicatorSnapshot::default();
        assert_eq!(Scheduler::entry_side(&snapshot), None);
    }

    #[test]
    fn shutdown_signal_starts_uncancelled() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
    }
}
