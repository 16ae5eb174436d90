// =============================================================================
// StagnantPositionHandler — closes positions that have gone nowhere
// =============================================================================
//
// A position open longer than `max_inactive_minutes` without having moved
// at least `min_profit_pips` in its favor is considered stagnant: it's tying
// up margin and a slot without the trade thesis having played out either
// way. Closes exactly those positions, nothing else. Never vetoes opens —
// staleness is a statement about existing positions, not about whether a
// new one should be allowed.
//
// An age plus distance threshold pair evaluated per position, generalized
// into the `RiskHandler` shape.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::types::{AccountSnapshot, Position, Symbol};

use super::{Priority, RiskHandler};

#[derive(Debug, Clone, Copy)]
pub struct StagnantPositionConfig {
    pub max_inactive_minutes: i64,
    pub min_profit_pips: f64,
}

impl Default for StagnantPositionConfig {
    fn default() -> Self {
        Self {
            max_inactive_minutes: 240,
            min_profit_pips: 5.0,
        }
    }
}

pub struct StagnantPositionHandler {
    gateway: Arc<BrokerGateway>,
    events: EventBus,
    symbols: HashMap<String, Symbol>,
    config: StagnantPositionConfig,
}

impl StagnantPositionHandler {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        events: EventBus,
        symbols: HashMap<String, Symbol>,
        config: StagnantPositionConfig,
    ) -> Self {
        Self {
            gateway,
            events,
            symbols,
            config,
        }
    }

    fn is_stagnant(&self, position: &Position) -> bool {
        let Some(symbol) = self.symbols.get(&position.symbol) else {
            return false;
        };
        let age_minutes = position.age(Utc::now()).num_minutes();
        age_minutes >= self.config.max_inactive_minutes && position.distance_pips(symbol) < self.config.min_profit_pips
    }

    fn stagnant_positions<'a>(&self, positions: &'a [Position]) -> Vec<&'a Position> {
        positions.iter().filter(|p| self.is_stagnant(p)).collect()
    }
}

#[async_trait]
impl RiskHandler for StagnantPositionHandler {
    fn name(&self) -> &'static str {
        "stagnant_position"
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn should_act(&self, _account: &AccountSnapshot, positions: &[Position]) -> bool {
        !self.stagnant_positions(positions).is_empty()
    }

    async fn act(&self, _account: &AccountSnapshot, positions: &[Position]) -> Result<bool, GatewayError> {
        let stale: Vec<u64> = self.stagnant_positions(positions).into_iter().map(|p| p.ticket).collect();
        for ticket in &stale {
            self.gateway.close_position(*ticket, None).await?;
            info!(ticket, "stagnant position closed");
            self.events.publish(Event::StagnantClosed { ticket: *ticket });
        }
        Ok(!stale.is_empty())
    }

    fn veto_open(
        &self,
        _account: &AccountSnapshot,
        _positions: &[Position],
        _symbol: &str,
        _volume: f64,
        _sl: Option<f64>,
        _tp: Option<f64>,
    ) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::types::Side;
    use chrono::Duration;
    use serde_json::json;

    fn symbols() -> HashMap<String, Symbol> {
        let mut m = HashMap::new();
        m.insert("EURUSD".to_string(), Symbol::new("EURUSD", 0.0001, 5));
        m
    }

    fn position(ticket: u64, minutes_old: i64, current_price: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 0.1,
            open_price: 1.1000,
            open_time: Utc::now() - Duration::minutes(minutes_old),
            magic: 0,
            comment: String::new(),
            stop_loss: None,
            take_profit: None,
            current_price,
            profit: 0.0,
            group_id: None,
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            free_margin: 10_000.0,
            margin_level_percent: 1000.0,
        }
    }

    #[tokio::test]
    async fn flags_old_flat_position_as_stagnant() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = StagnantPositionHandler::new(gateway, EventBus::new(), symbols(), StagnantPositionConfig::default());
        // 300 minutes old, only 1 pip moved — stagnant.
        let positions = vec![position(1, 300, 1.1001)];
        assert!(handler.should_act(&account(), &positions));
    }

    #[tokio::test]
    async fn ignores_young_position_even_if_flat() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = StagnantPositionHandler::new(gateway, EventBus::new(), symbols(), StagnantPositionConfig::default());
        let positions = vec![position(1, 10, 1.1001)];
        assert!(!handler.should_act(&account(), &positions));
    }

    #[tokio::test]
    async fn ignores_old_position_that_has_moved_favorably() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = StagnantPositionHandler::new(gateway, EventBus::new(), symbols(), StagnantPositionConfig::default());
        // 300 minutes old but +20 pips in favor.
        let positions = vec![position(1, 300, 1.1020)];
        assert!(!handler.should_act(&account(), &positions));
    }

    #[tokio::test]
    async fn act_closes_only_the_stagnant_tickets() {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response("close_position", json!({ "success": true, "profit": 1.0 }));
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = StagnantPositionHandler::new(gateway, EventBus::new(), symbols(), StagnantPositionConfig::default());
        let positions = vec![position(1, 300, 1.1001), position(2, 300, 1.1030)];
        let changed = handler.act(&account(), &positions).await.unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn never_vetoes_opens() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = StagnantPositionHandler::new(gateway, EventBus::new(), symbols(), StagnantPositionConfig::default());
        assert!(handler.veto_open(&account(), &[], "EURUSD", 0.1, None, None));
    }
}
