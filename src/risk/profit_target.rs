// =============================================================================
// ProfitTargetHandler — closes everything once a floating profit target hits
// =============================================================================
//
// A simple, stateless threshold: once the sum of floating profit across all
// positions reaches `profit_target_percent` of balance, close every position,
// most-profitable first (so the largest wins are locked in even if a close
// midway fails). Vetoes new opens for as long as the threshold currently
// holds — there is no point scaling further into a symbol the account is
// about to flatten.
//
// A single percent-of-balance threshold compared each tick, generalized
// into the `RiskHandler` shape.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::types::{AccountSnapshot, Position};

use super::{close_in_order, Priority, RiskHandler};

#[derive(Debug, Clone, Copy)]
pub struct ProfitTargetConfig {
    pub profit_target_percent: f64,
}

impl Default for ProfitTargetConfig {
    fn default() -> Self {
        Self {
            profit_target_percent: 5.0,
        }
    }
}

pub struct ProfitTargetHandler {
    gateway: std::sync::Arc<BrokerGateway>,
    events: EventBus,
    config: ProfitTargetConfig,
}

impl ProfitTargetHandler {
    pub fn new(gateway: std::sync::Arc<BrokerGateway>, events: EventBus, config: ProfitTargetConfig) -> Self {
        Self { gateway, events, config }
    }

    fn target_reached(&self, account: &AccountSnapshot, positions: &[Position]) -> bool {
        if positions.is_empty() {
            return false;
        }
        let total: f64 = positions.iter().map(|p| p.profit).sum();
        total >= account.balance * self.config.profit_target_percent / 100.0
    }
}

#[async_trait]
impl RiskHandler for ProfitTargetHandler {
    fn name(&self) -> &'static str {
        "profit_target"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn should_act(&self, account: &AccountSnapshot, positions: &[Position]) -> bool {
        self.target_reached(account, positions)
    }

    async fn act(&self, _account: &AccountSnapshot, positions: &[Position]) -> Result<bool, GatewayError> {
        // Descending profit: largest wins locked in first.
        let closed = close_in_order(&self.gateway, positions.to_vec(), |a, b| {
            b.profit.partial_cmp(&a.profit).unwrap_or(std::cmp::Ordering::Equal)
        })
        .await?;
        info!(closed, "profit target reached, positions closed");
        self.events.publish(Event::ProfitTargetReached { closed });
        Ok(closed > 0)
    }

    fn veto_open(
        &self,
        account: &AccountSnapshot,
        positions: &[Position],
        _symbol: &str,
        _volume: f64,
        _sl: Option<f64>,
        _tp: Option<f64>,
    ) -> bool {
        !self.target_reached(account, positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::MockBrokerTransport;
    use crate::types::Side;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn position(ticket: u64, profit: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 0.1,
            open_price: 1.1000,
            open_time: Utc::now(),
            magic: 0,
            comment: String::new(),
            stop_loss: None,
            take_profit: None,
            current_price: 1.1050,
            profit,
            group_id: None,
        }
    }

    fn account(balance: f64) -> AccountSnapshot {
        AccountSnapshot {
            balance,
            equity: balance,
            free_margin: balance,
            margin_level_percent: 1000.0,
        }
    }

    #[tokio::test]
    async fn should_act_once_target_percent_reached() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = ProfitTargetHandler::new(gateway, EventBus::new(), ProfitTargetConfig::default());
        let acct = account(10_000.0);
        // 5% of 10000 = 500.
        let positions = vec![position(1, 300.0), position(2, 250.0)];
        assert!(handler.should_act(&acct, &positions));
    }

    #[tokio::test]
    async fn should_not_act_below_target() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = ProfitTargetHandler::new(gateway, EventBus::new(), ProfitTargetConfig::default());
        let acct = account(10_000.0);
        let positions = vec![position(1, 100.0)];
        assert!(!handler.should_act(&acct, &positions));
    }

    #[tokio::test]
    async fn act_closes_all_positions_most_profitable_first() {
        let mock = Arc::new(MockBrokerTransport::new());
        mock.push_response("close_position", json!({ "success": true, "profit": 1.0 }));
        mock.push_response("close_position", json!({ "success": true, "profit": 1.0 }));
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = ProfitTargetHandler::new(gateway, EventBus::new(), ProfitTargetConfig::default());
        let acct = account(10_000.0);
        let positions = vec![position(1, 300.0), position(2, 250.0)];
        let changed = handler.act(&acct, &positions).await.unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn veto_open_rejects_while_target_is_met() {
        let mock = Arc::new(MockBrokerTransport::new());
        let gateway = Arc::new(BrokerGateway::new(mock));
        let handler = ProfitTargetHandler::new(gateway, EventBus::new(), ProfitTargetConfig::default());
        let acct = account(10_000.0);
        let positions = vec![position(1, 600.0)];
        assert!(!handler.veto_open(&acct, &positions, "EURUSD", 0.1, None, None));
    }
}
