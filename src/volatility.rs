// =============================================================================
// Volatility Manager — ATR-based {low, medium, high} classification
// =============================================================================
//
// Reads the live ATR for a symbol (preferring the broker's own
// `calculate_volatility`, falling back to the indicator engine's own ATR
// reading if that call fails), converts it to pips, and classifies it by
// two configurable thresholds. A class transition emits `VolatilityChanged`
// exactly once, using a compare-then-log transition check rather than
// logging on every tick.
//
// `stop_loss_for`/`take_profit_for` turn a classification into a concrete
// price: when a live ATR reading is on hand, the distance is
// `atr_pips * multiplier`; otherwise a per-class default pip distance is
// used, so a symbol with no ATR history yet still gets a sane SL/TP.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::indicators::IndicatorEngine;
use crate::types::{Side, Symbol, VolatilityClass};

/// Default SL/TP pip distances used when no live ATR reading is available
/// for a symbol yet.
#[derive(Debug, Clone, Copy)]
pub struct DefaultDistances {
    pub low: (f64, f64),
    pub medium: (f64, f64),
    pub high: (f64, f64),
}

impl Default for DefaultDistances {
    fn default() -> Self {
        Self {
            low: (15.0, 30.0),
            medium: (25.0, 50.0),
            high: (40.0, 80.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolatilityConfig {
    pub low_threshold_pips: f64,
    pub high_threshold_pips: f64,
    pub sl_atr_multiplier: f64,
    pub tp_atr_multiplier: f64,
    pub defaults: DefaultDistances,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            low_threshold_pips: 15.0,
            high_threshold_pips: 40.0,
            sl_atr_multiplier: 1.5,
            tp_atr_multiplier: 3.0,
            defaults: DefaultDistances::default(),
        }
    }
}

struct SymbolState {
    class: VolatilityClass,
    atr_pips: Option<f64>,
}

pub struct VolatilityManager {
    gateway: Arc<BrokerGateway>,
    indicators: Arc<IndicatorEngine>,
    events: EventBus,
    symbols: HashMap<String, Symbol>,
    config: VolatilityConfig,
    state: RwLock<HashMap<String, SymbolState>>,
}

impl VolatilityManager {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        indicators: Arc<IndicatorEngine>,
        events: EventBus,
        symbols: HashMap<String, Symbol>,
        config: VolatilityConfig,
    ) -> Self {
        Self {
            gateway,
            indicators,
            events,
            symbols,
            config,
            state: RwLock::new(HashMap::new()),
        }
    }

    fn classify(&self, atr_pips: f64) -> VolatilityClass {
        if atr_pips < self.config.low_threshold_pips {
            VolatilityClass::Low
        } else if atr_pips < self.config.high_threshold_pips {
            VolatilityClass::Medium
        } else {
            VolatilityClass::High
        }
    }

    /// Refresh the volatility class for `symbol` given `period` on
    /// `timeframe`. Returns the (possibly unchanged) current class.
    pub async fn refresh(
        &self,
        symbol: &str,
        timeframe: &str,
        period: u32,
    ) -> Result<VolatilityClass, GatewayError> {
        let sym = self.symbols.get(symbol).ok_or_else(|| GatewayError::Malformed {
            detail: format!("unknown symbol '{symbol}'"),
        })?;

        let atr_price_units = match self.gateway.calculate_volatility(symbol, timeframe, period).await {
            Ok(v) => v,
            Err(_) => {
                let snapshot = self.indicators.snapshot(symbol, timeframe).await?;
                snapshot.atr.ok_or_else(|| GatewayError::Malformed {
                    detail: format!("no ATR available for '{symbol}' from either the broker or the indicator engine"),
                })?
            }
        };

        let atr_pips = sym.price_delta_to_pips(atr_price_units).abs();
        let class = self.classify(atr_pips);

        let previous = {
            let mut state = self.state.write();
            let entry = state.entry(symbol.to_string()).or_insert(SymbolState {
                class,
                atr_pips: None,
            });
            let previous = entry.class;
            entry.class = class;
            entry.atr_pips = Some(atr_pips);
            previous
        };

        if previous != class {
            info!(symbol, ?previous, ?class, atr_pips, "volatility class changed");
            self.events.publish(Event::VolatilityChanged {
                symbol: symbol.to_string(),
                class,
            });
        }

        Ok(class)
    }

    pub fn current_class(&self, symbol: &str) -> Option<VolatilityClass> {
        self.state.read().get(symbol).map(|s| s.class)
    }

    fn distances_pips(&self, symbol: &str) -> (f64, f64) {
        let state = self.state.read();
        match state.get(symbol) {
            Some(SymbolState {
                atr_pips: Some(atr_pips),
                ..
            }) => (
                atr_pips * self.config.sl_atr_multiplier,
                atr_pips * self.config.tp_atr_multiplier,
            ),
            Some(SymbolState { class, .. }) => match class {
                VolatilityClass::Low => self.config.defaults.low,
                VolatilityClass::Medium => self.config.defaults.medium,
                VolatilityClass::High => self.config.defaults.high,
            },
            None => self.config.defaults.medium,
        }
    }

    pub fn stop_loss_for(&self, symbol: &str, entry_price: f64, side: Side) -> Option<f64> {
        let sym = self.symbols.get(symbol)?;
        let (sl_pips, _) = self.distances_pips(symbol);
        let delta = sym.pips_to_price_delta(sl_pips);
        Some(match side {
            Side::Buy => entry_price - delta,
            Side::Sell => entry_price + delta,
        })
    }

    pub fn take_profit_for(&self, symbol: &str, entry_price: f64, side: Side) -> Option<f64> {
        let sym = self.symbols.get(symbol)?;
        let (_, tp_pips) = self.distances_pips(symbol);
        let delta = sym.pips_to_price_delta(tp_pips);
        Some(match side {
            Side::Buy => entry_price + delta,
            Side::Sell => entry_price - delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::market_data::MarketDataCache;
    use serde_json::json;
    use std::time::Duration;

    fn manager_with_volatility(atr_price_units: f64) -> VolatilityManager {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response(
            "calculate_volatility",
            json!({ "success": true, "volatility": atr_price_units }),
        );
        let gateway = Arc::new(BrokerGateway::new(mock));
        let cache = Arc::new(MarketDataCache::new(gateway.clone(), Duration::from_secs(60), 50));
        let indicators = Arc::new(IndicatorEngine::new(cache, Default::default()));
        let mut symbols = HashMap::new();
        symbols.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));
        VolatilityManager::new(gateway, indicators, EventBus::new(), symbols, VolatilityConfig::default())
    }

    #[tokio::test]
    async fn classifies_low_volatility() {
        let mgr = manager_with_volatility(0.0005); // 5 pips
        let class = mgr.refresh("EURUSD", "1h", 14).await.unwrap();
        assert_eq!(class, VolatilityClass::Low);
    }

    #[tokio::test]
    async fn classifies_high_volatility() {
        let mgr = manager_with_volatility(0.0060); // 60 pips
        let class = mgr.refresh("EURUSD", "1h", 14).await.unwrap();
        assert_eq!(class, VolatilityClass::High);
    }

    #[tokio::test]
    async fn emits_volatility_changed_only_on_transition() {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response("calculate_volatility", json!({ "success": true, "volatility": 0.0005 }));
        mock.push_response("calculate_volatility", json!({ "success": true, "volatility": 0.0060 }));
        let gateway = Arc::new(BrokerGateway::new(mock));
        let cache = Arc::new(MarketDataCache::new(gateway.clone(), Duration::from_secs(60), 50));
        let indicators = Arc::new(IndicatorEngine::new(cache, Default::default()));
        let mut symbols = HashMap::new();
        symbols.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));

        let events = EventBus::new();
        let seen = Arc::new(RwLock::new(0usize));
        let seen2 = seen.clone();
        events.subscribe(move |e| {
            if matches!(e, Event::VolatilityChanged { .. }) {
                *seen2.write() += 1;
            }
        });

        let mgr = VolatilityManager::new(gateway, indicators, events, symbols, VolatilityConfig::default());
        mgr.refresh("EURUSD", "1h", 14).await.unwrap();
        mgr.refresh("EURUSD", "1h", 14).await.unwrap();
        assert_eq!(*seen.read(), 1);
    }

    #[tokio::test]
    async fn stop_loss_uses_live_atr_when_available() {
        let mgr = manager_with_volatility(0.0020); // 20 pips
        mgr.refresh("EURUSD", "1h", 14).await.unwrap();
        let sl = mgr.stop_loss_for("EURUSD", 1.1000, Side::Buy).unwrap();
        assert!(sl < 1.1000);
        assert!((1.1000 - sl - 0.0020 * 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_loss_falls_back_to_default_without_live_atr() {
        // No broker response queued and `refresh` is never called — this
        // exercises the "no reading yet for this symbol" branch directly.
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let cache = Arc::new(MarketDataCache::new(gateway.clone(), Duration::from_secs(60), 50));
        let indicators = Arc::new(IndicatorEngine::new(cache, Default::default()));
        let mut symbols = HashMap::new();
        symbols.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));
        let mgr = VolatilityManager::new(gateway, indicators, EventBus::new(), symbols, VolatilityConfig::default());

        let sl = mgr.stop_loss_for("EURUSD", 1.1000, Side::Buy).unwrap();
        assert!(sl < 1.1000);
    }
}
