// =============================================================================
// Trailing Manager — per-position Inactive/Armed ratchet
// =============================================================================
//
// Two states per position:
//   Inactive — default; arms once profit reaches `activation_distance_pips`.
//   Armed    — on each tick, proposes a tighter SL at `trailing_distance_pips`
//              behind the current price. The proposal is only ever sent to
//              the broker when it strictly improves the last commanded SL;
//              a rejected or unchanged modify leaves the trailing anchor
//              exactly where it was.
//
// A position that disappears from the store (closed or no longer reported)
// has its state discarded on the next `sweep`.
//
// Simplified from the order-flow-adaptive, three-phase trail this crate's
// exit logic used to carry: no CVD/VPIN/orderbook inputs here, just the
// activation-distance/trailing-distance pair and the never-widen ratchet.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::position_store::PositionStore;
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inactive,
    Armed,
}

#[derive(Debug, Clone, Copy)]
struct TrailState {
    phase: Phase,
    anchor_sl: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingConfig {
    pub activation_distance_pips: f64,
    pub trailing_distance_pips: f64,
}

pub struct TrailingManager {
    gateway: Arc<BrokerGateway>,
    store: Arc<PositionStore>,
    events: EventBus,
    symbols: HashMap<String, Symbol>,
    config: TrailingConfig,
    states: RwLock<HashMap<u64, TrailState>>,
}

impl TrailingManager {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        store: Arc<PositionStore>,
        events: EventBus,
        symbols: HashMap<String, Symbol>,
        config: TrailingConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            events,
            symbols,
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate every live position once. Drops state for any ticket the
    /// store no longer reports.
    pub async fn sweep(&self) -> Result<(), GatewayError> {
        let positions = self.store.positions();
        let live: std::collections::HashSet<u64> = positions.iter().map(|p| p.ticket).collect();
        self.states.write().retain(|ticket, _| live.contains(ticket));

        for position in positions {
            let Some(symbol) = self.symbols.get(&position.symbol) else {
                continue;
            };

            let profit_pips = position.distance_pips(symbol);

            let phase = {
                let states = self.states.read();
                states.get(&position.ticket).map(|s| s.phase).unwrap_or(Phase::Inactive)
            };

            if phase == Phase::Inactive {
                if profit_pips >= self.config.activation_distance_pips {
                    self.states.write().insert(
                        position.ticket,
                        TrailState {
                            phase: Phase::Armed,
                            anchor_sl: position.stop_loss,
                        },
                    );
                    debug!(ticket = position.ticket, profit_pips, "trailing armed");
                } else {
                    continue;
                }
            }

            let candidate_sl = match position.side {
                Side::Buy => position.current_price - symbol.pips_to_price_delta(self.config.trailing_distance_pips),
                Side::Sell => position.current_price + symbol.pips_to_price_delta(self.config.trailing_distance_pips),
            };

            let anchor = {
                let states = self.states.read();
                states.get(&position.ticket).and_then(|s| s.anchor_sl)
            };

            let improves = match (position.side, anchor) {
                (Side::Buy, Some(a)) => candidate_sl > a,
                (Side::Sell, Some(a)) => candidate_sl < a,
                (_, None) => true,
            };

            if !improves {
                continue;
            }

            match self
                .gateway
                .modify_position(position.ticket, Some(candidate_sl), position.take_profit)
                .await
            {
                Ok(()) => {
                    self.states.write().insert(
                        position.ticket,
                        TrailState {
                            phase: Phase::Armed,
                            anchor_sl: Some(candidate_sl),
                        },
                    );
                    info!(ticket = position.ticket, new_sl = candidate_sl, "trailing stop updated");
                    self.events.publish(Event::TrailingUpdated {
                        ticket: position.ticket,
                        new_stop_loss: candidate_sl,
                    });
                }
                Err(e) => {
                    debug!(ticket = position.ticket, error = %e, "trailing modify failed, anchor unchanged");
                }
            }
        }

        Ok(())
    }

    #[cfg(test)]
    fn anchor_for(&self, ticket: u64) -> Option<f64> {
        self.states.read().get(&ticket).and_then(|s| s.anchor_sl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::event_bus::EventBus;
    use crate::position_store::{PositionLimits, PositionStore};
    use serde_json::json;

    fn unlimited() -> PositionLimits {
        PositionLimits {
            max_total: 100,
            max_per_symbol: 100,
            max_per_group: 100,
        }
    }

    fn symbols() -> HashMap<String, Symbol> {
        let mut m = HashMap::new();
        m.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));
        m
    }

    fn position_json(current_price: f64, sl: Option<f64>) -> serde_json::Value {
        json!({
            "ticket": 1, "symbol": "EURUSD", "type": "buy", "volume": 0.1,
            "open_price": 1.1000, "open_time": "2024-01-01T00:00:00Z",
            "sl": sl, "tp": 1.1100, "current_price": current_price, "profit": 5.0
        })
    }

    async fn setup(current_price: f64, sl: Option<f64>) -> (TrailingManager, Arc<MockBrokerTransport>) {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response(
            "get_positions",
            json!({ "success": true, "positions": [position_json(current_price, sl)] }),
        );
        let gateway = Arc::new(BrokerGateway::new(mock.clone()));
        let store = Arc::new(PositionStore::new(gateway.clone(), EventBus::new(), unlimited()));
        store.reconcile().await.unwrap();
        let trailing = TrailingManager::new(
            gateway,
            store,
            EventBus::new(),
            symbols(),
            TrailingConfig {
                activation_distance_pips: 20.0,
                trailing_distance_pips: 10.0,
            },
        );
        (trailing, mock)
    }

    #[tokio::test]
    async fn stays_inactive_below_activation_distance() {
        // +5 pips profit, below the 20 pip activation threshold.
        let (trailing, _mock) = setup(1.1005, None).await;
        trailing.sweep().await.unwrap();
        assert!(trailing.anchor_for(1).is_none());
    }

    #[tokio::test]
    async fn arms_and_sets_initial_trail_once_activated() {
        // +25 pips profit: armed, trail 10 pips behind current price.
        let (trailing, mock) = setup(1.1025, None).await;
        mock.push_response("modify_position", json!({ "success": true }));
        trailing.sweep().await.unwrap();
        let anchor = trailing.anchor_for(1).unwrap();
        assert!((anchor - 1.1015).abs() < 1e-9);
    }

    #[tokio::test]
    async fn never_widens_an_existing_sl() {
        // Already armed with a tight SL; current price retreats so the
        // candidate trail would be looser than the existing SL.
        let (trailing, _mock) = setup(1.1021, Some(1.1019)).await;
        // Candidate = 1.1021 - 0.0010 = 1.1011, which is WORSE (lower) than
        // the existing 1.1019 — must not be sent.
        trailing.sweep().await.unwrap();
        assert!(trailing.anchor_for(1).is_none() || trailing.anchor_for(1) == Some(1.1019));
    }

    #[tokio::test]
    async fn discards_state_for_vanished_ticket() {
        let (trailing, mock) = setup(1.1025, None).await;
        mock.push_response("modify_position", json!({ "success": true }));
        trailing.sweep().await.unwrap();
        assert!(trailing.anchor_for(1).is_some());

        mock.push_response("get_positions", json!({ "success": true, "positions": [] }));
        // sweep() reads straight from the store, which must be reconciled
        // again to reflect the vanished ticket before the next sweep.
        trailing.store.reconcile().await.unwrap();
        trailing.sweep().await.unwrap();
        assert!(trailing.anchor_for(1).is_none());
    }
}
