// =============================================================================
// Market Data Cache — tick & OHLC cache with staleness bounds
// =============================================================================
//
// Holds the latest tick per symbol and the latest OHLC window per
// (symbol, timeframe). A read returns the cached value if it is fresh
// enough; otherwise it refreshes synchronously through the broker gateway.
// A background refresher (driven by the scheduler) polls on its own cadence
// and skips any key currently being refreshed on demand, coordinated through
// the same lock an `in_flight` marker set — mirroring the single-`RwLock`-
// per-collection idiom this crate uses everywhere else rather than one
// mutex per key.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::types::{Candle, Symbol, Tick};

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

struct Cached<T> {
    value: T,
    updated_at: DateTime<Utc>,
}

pub struct MarketDataCache {
    gateway: Arc<BrokerGateway>,
    symbols: HashMap<String, Symbol>,
    ticks: RwLock<HashMap<String, Cached<Tick>>>,
    ohlc: RwLock<HashMap<SeriesKey, Cached<Vec<Candle>>>>,
    in_flight_ticks: RwLock<std::collections::HashSet<String>>,
    in_flight_ohlc: RwLock<std::collections::HashSet<SeriesKey>>,
    max_age: Duration,
    ohlc_count: u32,
}

impl MarketDataCache {
    pub fn new(gateway: Arc<BrokerGateway>, max_age: Duration, ohlc_count: u32) -> Self {
        Self::with_symbols(gateway, HashMap::new(), max_age, ohlc_count)
    }

    /// Construct with the symbol table needed to convert a broker-reported
    /// spread (in points, see `BrokerGateway::check_spread`) back into a
    /// price delta via each symbol's own pip scale. A symbol with no entry
    /// falls back to `Symbol::default()`'s scale (see `fn symbol_for`).
    pub fn with_symbols(
        gateway: Arc<BrokerGateway>,
        symbols: HashMap<String, Symbol>,
        max_age: Duration,
        ohlc_count: u32,
    ) -> Self {
        Self {
            gateway,
            symbols,
            ticks: RwLock::new(HashMap::new()),
            ohlc: RwLock::new(HashMap::new()),
            in_flight_ticks: RwLock::new(std::collections::HashSet::new()),
            in_flight_ohlc: RwLock::new(std::collections::HashSet::new()),
            max_age,
            ohlc_count,
        }
    }

    /// The configured `Symbol` for `name`, or a default-scaled stand-in
    /// (five-decimal FX convention) if this cache was never told about it.
    fn symbol_for(&self, name: &str) -> Symbol {
        self.symbols
            .get(name)
            .cloned()
            .unwrap_or_else(|| Symbol::new(name, 0.0001, 5))
    }

    fn is_fresh(updated_at: DateTime<Utc>, max_age: Duration) -> bool {
        let age = Utc::now() - updated_at;
        age.to_std().map(|a| a <= max_age).unwrap_or(false)
    }

    /// Return the latest OHLC window for a symbol/timeframe, refreshing
    /// synchronously through the gateway if the cached value is stale or
    /// absent.
    pub async fn ohlc(&self, symbol: &str, timeframe: &str) -> Result<Vec<Candle>, GatewayError> {
        let key = SeriesKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        };

        if let Some(cached) = self.ohlc.read().get(&key) {
            if Self::is_fresh(cached.updated_at, self.max_age) {
                return Ok(cached.value.clone());
            }
        }

        self.refresh_ohlc(&key).await
    }

    /// Refresh one OHLC series, marking it in-flight so the background
    /// refresher skips it while this call is outstanding.
    pub async fn refresh_ohlc(&self, key: &SeriesKey) -> Result<Vec<Candle>, GatewayError> {
        if self.in_flight_ohlc.read().contains(key) {
            // Another caller is already refreshing; fall back to whatever
            // is cached rather than stacking duplicate requests.
            if let Some(cached) = self.ohlc.read().get(key) {
                return Ok(cached.value.clone());
            }
        }
        self.in_flight_ohlc.write().insert(key.clone());

        let result = self
            .gateway
            .get_ohlc(&key.symbol, &key.timeframe, self.ohlc_count)
            .await;

        self.in_flight_ohlc.write().remove(key);

        match result {
            Ok(candles) => {
                debug!(key = %key, count = candles.len(), "ohlc refreshed");
                self.ohlc.write().insert(
                    key.clone(),
                    Cached {
                        value: candles.clone(),
                        updated_at: Utc::now(),
                    },
                );
                Ok(candles)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn tick(&self, symbol: &str) -> Result<Tick, GatewayError> {
        if let Some(cached) = self.ticks.read().get(symbol) {
            if Self::is_fresh(cached.updated_at, self.max_age) {
                return Ok(cached.value);
            }
        }
        self.refresh_tick(symbol).await
    }

    pub async fn refresh_tick(&self, symbol: &str) -> Result<Tick, GatewayError> {
        if self.in_flight_ticks.read().contains(symbol) {
            if let Some(cached) = self.ticks.read().get(symbol) {
                return Ok(cached.value);
            }
        }
        self.in_flight_ticks.write().insert(symbol.to_string());

        // Tick quotes are derived from the most recent closed candle's close
        // price via the broker's spread check, since the opaque transport
        // (§6) exposes OHLC and spread, not a dedicated quote operation.
        let spread_points = self.gateway.check_spread(symbol).await;
        self.in_flight_ticks.write().remove(symbol);
        let spread_points = spread_points?;

        let candles = self.refresh_ohlc(&SeriesKey {
            symbol: symbol.to_string(),
            timeframe: "1m".to_string(),
        }).await?;
        let last_close = candles.last().map(|c| c.close).unwrap_or(0.0);
        // `spread_points` is `round((ask-bid)/pip_scale * 10)` (see
        // `Tick::spread_points`); invert that via the symbol's own pip
        // scale rather than assuming a price delta of 1.0 per pip.
        let symbol = self.symbol_for(symbol);
        let half_spread = symbol.pips_to_price_delta(spread_points as f64 / 10.0) / 2.0;

        let tick = Tick {
            bid: last_close - half_spread,
            ask: last_close + half_spread,
            timestamp: Utc::now(),
        };

        self.ticks.write().insert(
            symbol.to_string(),
            Cached {
                value: tick,
                updated_at: Utc::now(),
            },
        );
        Ok(tick)
    }

    /// Whether `key` is currently being refreshed on demand — consulted by
    /// the background refresher so it does not duplicate an in-flight call.
    pub fn ohlc_in_flight(&self, key: &SeriesKey) -> bool {
        self.in_flight_ohlc.read().contains(key)
    }

    pub fn tick_in_flight(&self, symbol: &str) -> bool {
        self.in_flight_ticks.read().contains(symbol)
    }
}
