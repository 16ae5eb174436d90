// =============================================================================
// Margin Control Plane — Main Entry Point
// =============================================================================
//
// Wires every component (broker gateway, event bus, market data cache,
// indicator engine, position store, volatility manager, trailing manager,
// scaling strategy, risk pipeline) and hands them to the scheduler, which
// owns the tick loop from there. Intentionally thin: argument parsing and
// credential loading beyond a couple of environment variables are out of
// scope, but some entry point has to exist to run the loop.
// =============================================================================

mod broker;
mod config;
mod engine_state;
mod error;
mod event_bus;
mod indicators;
mod market_data;
mod position_store;
mod risk;
mod scaling;
mod scheduler;
mod trailing;
mod types;
mod volatility;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerGateway, HttpBrokerTransport};
use crate::config::EngineConfig;
use crate::engine_state::ErrorLog;
use crate::event_bus::EventBus;
use crate::indicators::{IndicatorConfig, IndicatorEngine};
use crate::market_data::MarketDataCache;
use crate::position_store::{PositionLimits, PositionStore};
use crate::risk::{MarginProtector, MarginProtectorConfig, ProfitTargetConfig, ProfitTargetHandler};
use crate::risk::{RiskHandler, RiskPipeline, StagnantPositionConfig, StagnantPositionHandler};
use crate::scaling::{ScalingConfig, ScalingStrategy};
use crate::scheduler::{Scheduler, ShutdownSignal};
use crate::trailing::{TrailingConfig, TrailingManager};
use crate::volatility::VolatilityManager;

const DEFAULT_CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("margin control plane starting up");

    // -- 1. Configuration --------------------------------------------------
    let config_path = std::env::var("ENGINE_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match EngineConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %config_path, error = %e, "no usable config on disk, starting from defaults");
            let defaults = EngineConfig::default();
            if let Err(e) = defaults.save(&config_path) {
                warn!(error = %e, "failed to persist default config");
            }
            defaults
        }
    };

    // -- 2. Broker transport -------------------------------------------------
    let base_url = std::env::var("BROKER_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
    let api_key = std::env::var("BROKER_API_KEY").ok();
    let transport = Arc::new(HttpBrokerTransport::with_api_key(base_url, config.broker_timeout(), api_key));
    let gateway = Arc::new(BrokerGateway::new(transport));

    // -- 3. Ambient plumbing --------------------------------------------------
    let events = EventBus::new();
    let errors = Arc::new(ErrorLog::new());
    log_errors_to_tracing(&events);

    let symbols = config.symbol_table();
    info!(symbols = ?symbols.keys().collect::<Vec<_>>(), "trading symbols configured");

    // -- 4. Core components ----------------------------------------------------
    let store = Arc::new(PositionStore::new(
        Arc::clone(&gateway),
        events.clone(),
        PositionLimits {
            max_total: config.positions.max_total,
            max_per_symbol: config.positions.max_per_symbol,
            max_per_group: config.positions.max_per_group,
        },
    ));

    let cache = Arc::new(MarketDataCache::with_symbols(
        Arc::clone(&gateway),
        symbols.clone(),
        config.market_data_max_age(),
        config.market_data.ohlc_count,
    ));

    let indicators = Arc::new(IndicatorEngine::new(
        Arc::clone(&cache),
        IndicatorConfig {
            rsi_period: config.indicators.rsi_period,
            ema_period: config.indicators.ema_period,
            bollinger_period: config.indicators.bollinger_period,
            bollinger_std: config.indicators.bollinger_std,
            atr_period: config.indicators.atr_period,
            adx_period: config.indicators.adx_period,
            macd_fast: config.indicators.macd_fast,
            macd_slow: config.indicators.macd_slow,
            macd_signal: config.indicators.macd_signal,
            stoch_period: config.indicators.stoch_period,
            stoch_slowing: config.indicators.stoch_slowing,
        },
    ));

    let volatility = Arc::new(VolatilityManager::new(
        Arc::clone(&gateway),
        Arc::clone(&indicators),
        events.clone(),
        symbols.clone(),
        Default::default(),
    ));

    let trailing = Arc::new(TrailingManager::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        events.clone(),
        symbols.clone(),
        TrailingConfig {
            activation_distance_pips: config.trailing.activation_distance_pips,
            trailing_distance_pips: config.trailing.distance_pips,
        },
    ));

    let scaling = Arc::new(ScalingStrategy::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&volatility),
        events.clone(),
        symbols.clone(),
        ScalingConfig {
            initial_positions: config.scaling.initial_positions,
            additional_positions: config.scaling.additional_positions,
            trigger_pips: config.scaling.trigger_pips,
            lot_increment: config.scaling.lot_increment,
            lot_increment_step: config.scaling.lot_increment_step,
            max_positions: config.scaling.max_positions,
            max_level: config.scaling.max_level,
            base_volume: config.scaling.base_volume,
            magic: config.execution.magic_number,
        },
    ));

    // -- 5. Risk pipeline, ordered by priority at construction time -----------
    let handlers: Vec<Box<dyn RiskHandler>> = vec![
        Box::new(MarginProtector::new(
            Arc::clone(&gateway),
            events.clone(),
            MarginProtectorConfig {
                min_free_margin: config.risk.margin.min_free_margin,
                critical_margin_level_percent: config.risk.margin.critical_margin_level,
                warning_margin_level_percent: config.risk.margin.warning_margin_level,
            },
        )),
        Box::new(ProfitTargetHandler::new(
            Arc::clone(&gateway),
            events.clone(),
            ProfitTargetConfig {
                profit_target_percent: config.risk.profit_target.profit_target_percent,
            },
        )),
        Box::new(StagnantPositionHandler::new(
            Arc::clone(&gateway),
            events.clone(),
            symbols.clone(),
            StagnantPositionConfig {
                max_inactive_minutes: config.risk.stagnant.max_inactive_minutes,
                min_profit_pips: config.risk.stagnant.min_profit_pips,
            },
        )),
    ];
    let risk = Arc::new(RiskPipeline::new(handlers));

    // -- 6. Scheduler ------------------------------------------------------
    let shutdown = ShutdownSignal::new();
    let mut scheduler = Scheduler::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        cache,
        indicators,
        volatility,
        trailing,
        scaling,
        risk,
        events,
        errors,
        symbols,
        config.clone(),
        shutdown.clone(),
    );

    let scheduler_task = tokio::spawn(async move {
        scheduler.run().await;
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    shutdown.cancel();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task did not shut down cleanly");
    }

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("margin control plane shut down complete");
    Ok(())
}

/// Mirror every published `Error` event into the tracing log, so a failure
/// is visible on the log sink even without inspecting the in-memory ring
/// buffer.
fn log_errors_to_tracing(events: &EventBus) {
    events.subscribe(|event| {
        if let crate::event_bus::Event::Error { source, message } = event {
            error!(source = %source, "{message}");
        }
    });
}
