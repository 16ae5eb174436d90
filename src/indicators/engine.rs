// =============================================================================
// Indicator Engine — per-(symbol, timeframe) snapshot cache
// =============================================================================
//
// Wraps the pure indicator functions and the market data cache into a single
// `snapshot(symbol, timeframe)` call. A computed `IndicatorSnapshot` is kept
// keyed by `SeriesKey` and is only recomputed when the underlying OHLC
// window has actually advanced — identified by the `open_time` of its most
// recent candle, mirroring the candle-window cache-invalidation idiom this
// crate carries from its k-line buffering days.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::GatewayError;
use crate::market_data::{MarketDataCache, SeriesKey};
use crate::types::IndicatorSnapshot;

use super::adx::calculate_adx;
use super::atr::calculate_atr;
use super::bollinger::calculate_bollinger;
use super::ema::calculate_ema;
use super::macd::calculate_macd;
use super::rsi::current_rsi;
use super::stochastic::calculate_stochastic;

/// Look-back periods for every indicator the engine computes. Defaults match
/// the conventional settings for each indicator.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub ema_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub atr_period: usize,
    pub adx_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub stoch_period: usize,
    pub stoch_slowing: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            ema_period: 20,
            bollinger_period: 20,
            bollinger_std: 2.0,
            atr_period: 14,
            adx_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            stoch_period: 14,
            stoch_slowing: 3,
        }
    }
}

struct CachedSnapshot {
    snapshot: IndicatorSnapshot,
    source_open_time: DateTime<Utc>,
}

pub struct IndicatorEngine {
    cache: Arc<MarketDataCache>,
    config: IndicatorConfig,
    snapshots: RwLock<HashMap<SeriesKey, CachedSnapshot>>,
}

impl IndicatorEngine {
    pub fn new(cache: Arc<MarketDataCache>, config: IndicatorConfig) -> Self {
        Self {
            cache,
            config,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the current indicator reading for `symbol`/`timeframe`,
    /// recomputing only if the OHLC window has advanced since the last call.
    pub async fn snapshot(&self, symbol: &str, timeframe: &str) -> Result<IndicatorSnapshot, GatewayError> {
        let key = SeriesKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        };

        let candles = self.cache.ohlc(symbol, timeframe).await?;
        let latest_open_time = match candles.last() {
            Some(c) => c.open_time,
            None => return Ok(IndicatorSnapshot::default()),
        };

        if let Some(cached) = self.snapshots.read().get(&key) {
            if cached.source_open_time == latest_open_time {
                return Ok(cached.snapshot);
            }
        }

        let snapshot = self.compute(&candles);
        self.snapshots.write().insert(
            key,
            CachedSnapshot {
                snapshot,
                source_open_time: latest_open_time,
            },
        );
        Ok(snapshot)
    }

    fn compute(&self, candles: &[crate::types::Candle]) -> IndicatorSnapshot {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = closes.last().copied();

        let (rsi, _) = current_rsi(&closes, self.config.rsi_period).unzip();

        let ema = calculate_ema(&closes, self.config.ema_period).last().copied();

        let boll = calculate_bollinger(&closes, self.config.bollinger_period, self.config.bollinger_std);

        let macd = calculate_macd(
            &closes,
            self.config.macd_fast,
            self.config.macd_slow,
            self.config.macd_signal,
        );

        let adx = calculate_adx(candles, self.config.adx_period);
        let atr = calculate_atr(candles, self.config.atr_period);
        let stoch = calculate_stochastic(candles, self.config.stoch_period, self.config.stoch_slowing);

        IndicatorSnapshot {
            price,
            rsi,
            macd: macd.map(|m| m.macd),
            macd_signal: macd.map(|m| m.signal),
            macd_histogram: macd.map(|m| m.histogram),
            boll_upper: boll.as_ref().map(|b| b.upper),
            boll_middle: boll.as_ref().map(|b| b.middle),
            boll_lower: boll.as_ref().map(|b| b.lower),
            adx,
            stoch_k: stoch.as_ref().map(|s| s.k),
            stoch_d: stoch.as_ref().map(|s| s.d),
            atr,
            ema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::broker::BrokerGateway;
    use serde_json::json;
    use std::time::Duration;

    fn candles_json(n: usize) -> Vec<serde_json::Value> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64;
                json!({
                    "open_time": format!("2024-01-01T00:{:02}:00Z", i % 60),
                    "open": base, "high": base + 1.0, "low": base - 1.0, "close": base + 0.5,
                    "volume": 10.0
                })
            })
            .collect()
    }

    fn engine_with_candles(n: usize) -> IndicatorEngine {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response(
            "get_market_data",
            json!({ "success": true, "data": candles_json(n) }),
        );
        let gateway = Arc::new(BrokerGateway::new(mock));
        let cache = Arc::new(MarketDataCache::new(gateway, Duration::from_secs(300), n as u32));
        IndicatorEngine::new(cache, IndicatorConfig::default())
    }

    #[tokio::test]
    async fn snapshot_reports_price_even_with_short_history() {
        let engine = engine_with_candles(5);
        let snap = engine.snapshot("EURUSD", "1m").await.unwrap();
        assert!(snap.price.is_some());
        assert!(snap.rsi.is_none(), "5 candles is not enough for a 14-period RSI");
    }

    #[tokio::test]
    async fn snapshot_populates_all_fields_with_enough_history() {
        let engine = engine_with_candles(60);
        let snap = engine.snapshot("EURUSD", "1m").await.unwrap();
        assert!(snap.rsi.is_some());
        assert!(snap.ema.is_some());
        assert!(snap.boll_upper.is_some());
        assert!(snap.atr.is_some());
        assert!(snap.adx.is_some());
        assert!(snap.stoch_k.is_some());
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_the_window_advances() {
        let engine = engine_with_candles(60);
        let first = engine.snapshot("EURUSD", "1m").await.unwrap();
        // No second broker response queued; a cache hit is the only way
        // this second call can succeed.
        let second = engine.snapshot("EURUSD", "1m").await.unwrap();
        assert_eq!(first.price, second.price);
    }
}
