// =============================================================================
// MarginProtector — highest-priority handler, protects against a margin call
// =============================================================================
//
// Enters a safe state when free margin drops below a floor or the margin
// level drops below a critical threshold. While active, `veto_open` rejects
// every new order and `act` closes positions most-losing-first until the
// margin level recovers past the warning threshold, refreshing the account
// snapshot after each close so it never closes more than necessary.
//
// A named threshold ladder (most-severe-wins) plus an explicit safe-state
// entry/clear pair, generalized into the `RiskHandler` trait.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::types::{AccountSnapshot, Position};

use super::{Priority, RiskHandler};

#[derive(Debug, Clone, Copy)]
pub struct MarginProtectorConfig {
    pub min_free_margin: f64,
    pub critical_margin_level_percent: f64,
    pub warning_margin_level_percent: f64,
}

impl Default for MarginProtectorConfig {
    fn default() -> Self {
        Self {
            min_free_margin: 100.0,
            critical_margin_level_percent: 120.0,
            warning_margin_level_percent: 200.0,
        }
    }
}

pub struct MarginProtector {
    gateway: std::sync::Arc<BrokerGateway>,
    events: EventBus,
    config: MarginProtectorConfig,
    safe_state: AtomicBool,
}

impl MarginProtector {
    pub fn new(gateway: std::sync::Arc<BrokerGateway>, events: EventBus, config: MarginProtectorConfig) -> Self {
        Self {
            gateway,
            events,
            config,
            safe_state: AtomicBool::new(false),
        }
    }

    fn breached(&self, account: &AccountSnapshot) -> bool {
        account.free_margin < self.config.min_free_margin
            || account.margin_level_percent < self.config.critical_margin_level_percent
    }
}

#[async_trait]
impl RiskHandler for MarginProtector {
    fn name(&self) -> &'static str {
        "margin_protector"
    }

    fn priority(&self) -> Priority {
        Priority::Highest
    }

    fn should_act(&self, account: &AccountSnapshot, positions: &[Position]) -> bool {
        // The safe-state clear check must run even with no open positions —
        // otherwise a safe state entered while positions existed can never
        // clear once they're gone by some other path, leaving `veto_open`
        // rejecting every order indefinitely. `act`'s close loop already
        // no-ops safely on an empty position list.
        self.safe_state.load(Ordering::SeqCst) || (!positions.is_empty() && self.breached(account))
    }

    async fn act(&self, account: &AccountSnapshot, positions: &[Position]) -> Result<bool, GatewayError> {
        if !self.safe_state.swap(true, Ordering::SeqCst) {
            warn!(
                free_margin = account.free_margin,
                margin_level = account.margin_level_percent,
                "margin protector entering safe state"
            );
            self.events.publish(Event::MarginCritical);
        }

        // Most-losing first: ascending profit order.
        let mut remaining: Vec<Position> = positions.to_vec();
        remaining.sort_by(|a, b| a.profit.partial_cmp(&b.profit).unwrap_or(std::cmp::Ordering::Equal));

        let mut closed = 0;
        let mut level = account.margin_level_percent;
        for pos in remaining {
            if level > self.config.warning_margin_level_percent {
                break;
            }
            self.gateway.close_position(pos.ticket, None).await?;
            closed += 1;
            // Closing the most-losing position frees margin and raises the
            // level; re-read the account so we stop the moment it's safe
            // rather than closing everything indiscriminately.
            let refreshed = self.gateway.get_account_info().await?;
            level = refreshed.margin_level_percent;
        }

        if level > self.config.warning_margin_level_percent {
            self.safe_state.store(false, Ordering::SeqCst);
            info!(margin_level = level, "margin protector clearing safe state");
            self.events.publish(Event::MarginSafe);
        }

        info!(closed, margin_level = level, "margin protector acted");
        Ok(closed > 0)
    }

    fn veto_open(
        &self,
        account: &AccountSnapshot,
        _positions: &[Position],
        _symbol: &str,
        _volume: f64,
        _sl: Option<f64>,
        _tp: Option<f64>,
    ) -> bool {
        if self.safe_state.load(Ordering::SeqCst) {
            return false;
        }
        if account.free_margin < self.config.min_free_margin {
            return false;
        }
        if account.margin_level_percent < self.config.warning_margin_level_percent {
            return false;
        }
        true
    }
}
