// =============================================================================
// Core domain types shared across every component.
// =============================================================================
//
// These are the typed records the broker gateway decodes into exactly once
// (see `broker::gateway`). No other module should touch an untyped
// `serde_json::Value` coming from the broker.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which direction a position or pending order faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite direction; used when a handler needs to close a position
    /// by submitting the inverse order.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A tradable instrument. Carries the scale needed to convert a raw price
/// delta into pips, since that conversion differs per symbol (e.g. JPY pairs
/// vs. five-decimal majors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub pip_scale: f64,
    pub price_precision: u32,
}

impl Symbol {
    pub fn new(name: impl Into<String>, pip_scale: f64, price_precision: u32) -> Self {
        Self {
            name: name.into(),
            pip_scale,
            price_precision,
        }
    }

    pub fn price_delta_to_pips(&self, delta: f64) -> f64 {
        delta / self.pip_scale
    }

    pub fn pips_to_price_delta(&self, pips: f64) -> f64 {
        pips * self.pip_scale
    }
}

/// One OHLC bar. Immutable once observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A quoted bid/ask pair at an instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Spread expressed in whole price points (not pips) per the broker's
    /// own `check_spread` convention (see `broker::gateway::check_spread`).
    pub fn spread_points(&self, symbol: &Symbol) -> i64 {
        (((self.ask - self.bid) / symbol.pip_scale) * 10.0).round() as i64
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Technical-indicator readings for one symbol at one computation cycle.
/// Any field the engine did not have enough history to compute is `None`
/// rather than a sentinel value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub boll_upper: Option<f64>,
    pub boll_middle: Option<f64>,
    pub boll_lower: Option<f64>,
    pub adx: Option<f64>,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub atr: Option<f64>,
    pub ema: Option<f64>,
}

/// Volatility tier derived from a symbol's ATR reading (see `volatility`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityClass {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for VolatilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolatilityClass::Low => write!(f, "low"),
            VolatilityClass::Medium => write!(f, "medium"),
            VolatilityClass::High => write!(f, "high"),
        }
    }
}

/// A position known to the broker. `ticket` is assigned by the broker and
/// is the only identity this type ever carries — it is never re-minted
/// locally (see invariant I1 of the position store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    pub magic: i64,
    pub comment: String,

    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub current_price: f64,
    pub profit: f64,

    pub group_id: Option<Uuid>,
}

impl Position {
    /// Favorable distance travelled since entry, in pips. Negative means
    /// the position is underwater.
    pub fn distance_pips(&self, symbol: &Symbol) -> f64 {
        let raw = match self.side {
            Side::Buy => self.current_price - self.open_price,
            Side::Sell => self.open_price - self.current_price,
        };
        symbol.price_delta_to_pips(raw)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.open_time
    }
}

/// A set of positions opened by one scaling plan on one symbol/side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub anchor_price: f64,
    pub level: u32,
    pub completed: bool,
    pub tickets: std::collections::BTreeSet<u64>,
}

impl Group {
    pub fn new(symbol: impl Into<String>, side: Side, anchor_price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            anchor_price,
            level: 0,
            completed: false,
            tickets: std::collections::BTreeSet::new(),
        }
    }
}

/// Account-level figures, re-read from the broker on every control tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub free_margin: f64,
    pub margin_level_percent: f64,
}
