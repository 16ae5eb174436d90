// =============================================================================
// Risk Pipeline — ordered, independent risk handlers
// =============================================================================
//
// A `RiskHandler` advertises a priority and answers three pure-from-the-
// outside questions: whether it wants to act, how to act, and whether to
// veto a proposed new order. `RiskPipeline` holds an ordered list and
// evaluates it highest-priority-first every tick, letting each handler act
// independently — an acting handler does not stop lower-priority handlers
// from also acting, since each re-reads the position store rather than
// working off a stale snapshot.
//
// A named, thresholded check with a serializable snapshot and a "most
// severe breaker wins" evaluation idiom, generalized here into a trait so
// new handlers can be added without touching the pipeline itself.
// =============================================================================

pub mod margin_protector;
pub mod profit_target;
pub mod stagnant_position;

pub use margin_protector::MarginProtector;
pub use profit_target::ProfitTargetHandler;
pub use stagnant_position::StagnantPositionHandler;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::position_store::PositionStore;
use crate::types::{AccountSnapshot, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

#[async_trait]
pub trait RiskHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> Priority;

    fn should_act(&self, account: &AccountSnapshot, positions: &[Position]) -> bool;

    /// Act on the current account/position state. Returns whether anything
    /// actually changed.
    async fn act(&self, account: &AccountSnapshot, positions: &[Position]) -> Result<bool, GatewayError>;

    /// Consulted before every new order. `false` vetoes the order.
    fn veto_open(
        &self,
        account: &AccountSnapshot,
        positions: &[Position],
        symbol: &str,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> bool;
}

pub struct RiskPipeline {
    handlers: Vec<Box<dyn RiskHandler>>,
}

impl RiskPipeline {
    pub fn new(mut handlers: Vec<Box<dyn RiskHandler>>) -> Self {
        handlers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { handlers }
    }

    /// Evaluate every handler, highest priority first, invoking `act()`
    /// wherever `should_act()` currently holds. Positions are re-read from
    /// `store` before every handler so a higher-priority handler's closes
    /// are visible to the next one rather than working off a stale,
    /// tick-start snapshot. A read-path failure from one handler does not
    /// stop the rest of the pipeline from running.
    pub async fn evaluate(
        &self,
        account: &AccountSnapshot,
        store: &PositionStore,
    ) -> Vec<(&'static str, Result<bool, GatewayError>)> {
        let mut results = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let positions = store.positions();
            if handler.should_act(account, &positions) {
                let outcome = handler.act(account, &positions).await;
                results.push((handler.name(), outcome));
            }
        }
        results
    }

    /// `false` if any handler vetoes the order.
    pub fn veto_open(
        &self,
        account: &AccountSnapshot,
        positions: &[Position],
        symbol: &str,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> bool {
        self.handlers
            .iter()
            .all(|h| h.veto_open(account, positions, symbol, volume, sl, tp))
    }
}

/// Shared helper: close positions via the gateway in the order given by
/// `order_by`. Used by `ProfitTargetHandler`; `MarginProtector` inlines its
/// own loop since it must re-read the account between closes.
pub(crate) async fn close_in_order<F>(
    gateway: &crate::broker::BrokerGateway,
    mut ordered: Vec<Position>,
    order_by: F,
) -> Result<usize, GatewayError>
where
    F: Fn(&Position, &Position) -> std::cmp::Ordering,
{
    ordered.sort_by(|a, b| order_by(a, b));
    let mut closed = 0;
    for pos in ordered {
        gateway.close_position(pos.ticket, None).await?;
        closed += 1;
    }
    Ok(closed)
}
