// =============================================================================
// Scaling Strategy — per-Group level/anchor/completed finite state machine
// =============================================================================
//
// A scaling plan lives entirely inside one `Group` (see `position_store`):
// `level`, `anchor_price`, and `completed`. Each control tick evaluates every
// live group through three ordered transitions — Open initial, Advance
// level, Complete — never more than one per tick, so a price move large
// enough to justify two levels of advance still only advances one.
//
// The state machine shape (an explicit state struct, a per-tick `evaluate`,
// monotonic one-direction transitions) is the same one used for single-
// position exit tracking elsewhere in this lineage, generalized here from a
// single position to a group of them, returning a proposal for the caller
// to submit through one choke point rather than acting directly.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::position_store::PositionStore;
use crate::types::{Side, Symbol};
use crate::volatility::VolatilityManager;

#[derive(Debug, Clone, Copy)]
pub struct ScalingConfig {
    pub initial_positions: u32,
    pub additional_positions: u32,
    pub trigger_pips: f64,
    pub lot_increment: f64,
    pub lot_increment_step: u32,
    pub max_positions: usize,
    pub max_level: u32,
    pub base_volume: f64,
    pub magic: i64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            initial_positions: 1,
            additional_positions: 1,
            trigger_pips: 20.0,
            lot_increment: 0.01,
            lot_increment_step: 1,
            max_positions: 5,
            max_level: 5,
            base_volume: 0.01,
            magic: 0,
        }
    }
}

pub struct ScalingStrategy {
    gateway: Arc<BrokerGateway>,
    store: Arc<PositionStore>,
    volatility: Arc<VolatilityManager>,
    events: EventBus,
    symbols: HashMap<String, Symbol>,
    config: ScalingConfig,
}

impl ScalingStrategy {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        store: Arc<PositionStore>,
        volatility: Arc<VolatilityManager>,
        events: EventBus,
        symbols: HashMap<String, Symbol>,
        config: ScalingConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            volatility,
            events,
            symbols,
            config,
        }
    }

    fn lot_for_level(&self, level: u32) -> f64 {
        let steps = level / self.config.lot_increment_step.max(1);
        self.config.base_volume + self.config.lot_increment * steps as f64
    }

    /// Evaluate one group for exactly one transition. Returns `true` if a
    /// transition (or at least one new order) occurred.
    pub async fn evaluate_group(&self, group_id: Uuid) -> Result<bool, GatewayError> {
        let Some(group) = self.store.group(group_id) else {
            return Ok(false);
        };
        if group.completed {
            return Ok(false);
        }

        // -- Complete --------------------------------------------------------
        if group.tickets.len() >= self.config.max_positions || group.level >= self.config.max_level {
            self.store.complete_group(group_id);
            info!(%group_id, level = group.level, size = group.tickets.len(), "scaling group completed");
            self.events.publish(Event::ScalingCompleted { group_id });
            return Ok(true);
        }

        // -- Open initial ------------------------------------------------------
        if group.tickets.is_empty() {
            let sl = self.volatility.stop_loss_for(&group.symbol, group.anchor_price, group.side);
            let tp = self.volatility.take_profit_for(&group.symbol, group.anchor_price, group.side);
            let opened = self
                .open_batch(&group.symbol, group.side, 0, self.config.initial_positions, sl, tp, Some(group_id))
                .await?;
            if opened > 0 {
                info!(%group_id, opened, "scaling group opened initial positions");
                self.events.publish(Event::ScalingTriggered {
                    group_id,
                    level: 0,
                    opened,
                });
            }
            return Ok(opened > 0);
        }

        // -- Advance level -----------------------------------------------------
        let Some(symbol) = self.symbols.get(&group.symbol) else {
            tracing::warn!(symbol = %group.symbol, %group_id, "scaling group references an unconfigured symbol, skipping");
            return Ok(false);
        };
        let positions = self.store.positions_for_symbol(&group.symbol);
        let group_positions: Vec<_> = positions.iter().filter(|p| p.group_id == Some(group_id)).collect();

        let best_distance = group_positions
            .iter()
            .map(|p| p.distance_pips(symbol))
            .fold(f64::MIN, f64::max);

        let trigger = self.config.trigger_pips * (group.level as f64 + 1.0);
        if best_distance >= trigger {
            let (sl, tp) = group_positions
                .first()
                .map(|p| (p.stop_loss, p.take_profit))
                .unwrap_or((None, None));

            self.store.advance_group_level(group_id);
            let new_level = group.level + 1;
            let opened = self
                .open_batch(
                    &group.symbol,
                    group.side,
                    new_level,
                    self.config.additional_positions,
                    sl,
                    tp,
                    Some(group_id),
                )
                .await?;
            info!(%group_id, level = new_level, opened, "scaling group advanced");
            self.events.publish(Event::ScalingTriggered {
                group_id,
                level: new_level,
                opened,
            });
            return Ok(true);
        }

        Ok(false)
    }

    /// Submit up to `count` market orders for `symbol`/`side` carrying the
    /// given `sl`/`tp`, stopping early the moment `can_open` refuses one.
    /// Returns the number of confirmed tickets, each attached to
    /// `group_id` when given.
    async fn open_batch(
        &self,
        symbol: &str,
        side: Side,
        level: u32,
        count: u32,
        sl: Option<f64>,
        tp: Option<f64>,
        group_id: Option<Uuid>,
    ) -> Result<usize, GatewayError> {
        let volume = self.lot_for_level(level);
        let mut opened = 0usize;

        for _ in 0..count {
            let (allowed, reason) = self.store.can_open(symbol, group_id);
            if !allowed {
                info!(symbol, reason, "scaling batch stopped by can_open");
                break;
            }

            let (ticket, _price) = self
                .gateway
                .market_order(symbol, side, volume, sl, tp, "scaling", self.config.magic)
                .await?;

            if let Some(group_id) = group_id {
                self.store.attach(ticket, group_id);
            }
            opened += 1;
        }

        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::indicators::{IndicatorConfig, IndicatorEngine};
    use crate::market_data::MarketDataCache;
    use crate::position_store::PositionLimits;
    use serde_json::json;
    use std::time::Duration;

    fn symbols() -> HashMap<String, Symbol> {
        let mut m = HashMap::new();
        m.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));
        m
    }

    fn unlimited() -> PositionLimits {
        PositionLimits {
            max_total: 100,
            max_per_symbol: 100,
            max_per_group: 100,
        }
    }

    fn strategy(config: ScalingConfig) -> (ScalingStrategy, Arc<MockBrokerTransport>, Arc<PositionStore>) {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock.clone()));
        let store = Arc::new(PositionStore::new(gateway.clone(), EventBus::new(), unlimited()));
        let cache = Arc::new(MarketDataCache::new(gateway.clone(), Duration::from_secs(60), 50));
        let indicators = Arc::new(IndicatorEngine::new(cache, IndicatorConfig::default()));
        let volatility = Arc::new(VolatilityManager::new(
            gateway.clone(),
            indicators,
            EventBus::new(),
            symbols(),
            Default::default(),
        ));
        let strategy = ScalingStrategy::new(gateway, store.clone(), volatility, EventBus::new(), symbols(), config);
        (strategy, mock, store)
    }

    #[tokio::test]
    async fn opens_initial_batch_for_empty_group() {
        let (strategy, mock, store) = strategy(ScalingConfig {
            initial_positions: 2,
            ..Default::default()
        });
        let group_id = store.create_group("EURUSD", Side::Buy, 1.1000);

        mock.push_response("market_buy", json!({ "success": true, "ticket": 1, "price": 1.1000 }));
        mock.push_response("market_buy", json!({ "success": true, "ticket": 2, "price": 1.1001 }));

        let changed = strategy.evaluate_group(group_id).await.unwrap();
        assert!(changed);
        assert_eq!(store.group(group_id).unwrap().tickets.len(), 2);
    }

    #[tokio::test]
    async fn completes_group_at_max_level() {
        let (strategy, _mock, store) = strategy(ScalingConfig {
            max_level: 0,
            ..Default::default()
        });
        let group_id = store.create_group("EURUSD", Side::Buy, 1.1000);
        let changed = strategy.evaluate_group(group_id).await.unwrap();
        assert!(changed);
        assert!(store.group(group_id).unwrap().completed);
    }

    #[tokio::test]
    async fn completed_group_is_never_reevaluated() {
        let (strategy, _mock, store) = strategy(ScalingConfig {
            max_level: 0,
            ..Default::default()
        });
        let group_id = store.create_group("EURUSD", Side::Buy, 1.1000);
        strategy.evaluate_group(group_id).await.unwrap();
        // Second call must not touch the broker at all (no responses
        // queued) — it returns immediately because `completed` is true.
        let changed = strategy.evaluate_group(group_id).await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn batch_stops_early_when_can_open_refuses() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock.clone()));
        let store = Arc::new(PositionStore::new(
            gateway.clone(),
            EventBus::new(),
            PositionLimits {
                max_total: 1,
                max_per_symbol: 100,
                max_per_group: 100,
            },
        ));
        let cache = Arc::new(MarketDataCache::new(gateway.clone(), Duration::from_secs(60), 50));
        let indicators = Arc::new(IndicatorEngine::new(cache, IndicatorConfig::default()));
        let volatility = Arc::new(VolatilityManager::new(
            gateway.clone(),
            indicators,
            EventBus::new(),
            symbols(),
            Default::default(),
        ));
        let strategy = ScalingStrategy::new(
            gateway,
            store.clone(),
            volatility,
            EventBus::new(),
            symbols(),
            ScalingConfig {
                initial_positions: 3,
                ..Default::default()
            },
        );

        let group_id = store.create_group("EURUSD", Side::Buy, 1.1000);
        // Only one response queued: `can_open` must refuse the 2nd/3rd
        // order before the batch tries to call the broker again.
        mock.push_response("market_buy", json!({ "success": true, "ticket": 1, "price": 1.1000 }));
        let changed = strategy.evaluate_group(group_id).await.unwrap();
        assert!(changed);
        assert_eq!(store.group(group_id).unwrap().tickets.len(), 1);
    }
}
