// =============================================================================
// Broker Gateway — typed operation facade over the opaque transport
// =============================================================================
//
// Decodes every response exactly once into the domain types of `crate::types`.
// Reads are retried with linear backoff on `Transport`/`Timeout`; writes are
// never retried — a caller that wants to try again after a failed order must
// decide to do so on the next control tick, same as the rest of the control
// plane.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::error::GatewayError;
use crate::types::{AccountSnapshot, Candle, Position, Side};

use super::transport::BrokerTransport;

const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub struct BrokerGateway {
    transport: Arc<dyn BrokerTransport>,
}

impl BrokerGateway {
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self { transport }
    }

    /// Linear backoff around a read-only operation. Write operations must
    /// not call this — see `submit_write`.
    async fn call_with_retry(&self, op: &str, params: Value) -> Result<Value, GatewayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.call(op, params.clone()).await {
                Ok(v) => return Ok(v),
                Err(e @ (GatewayError::Transport(_) | GatewayError::Timeout(_)))
                    if attempt < READ_RETRY_ATTEMPTS =>
                {
                    warn!(op, attempt, error = %e, "read operation failed, retrying");
                    tokio::time::sleep(READ_RETRY_BASE_DELAY * attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_write(&self, op: &str, params: Value) -> Result<Value, GatewayError> {
        self.transport.call(op, params).await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "gateway::get_account_info")]
    pub async fn get_account_info(&self) -> Result<AccountSnapshot, GatewayError> {
        let body = self.call_with_retry("get_account_info", json!({})).await?;
        let info = body.get("account_info").ok_or_else(|| GatewayError::Malformed {
            detail: "response missing 'account_info'".to_string(),
        })?;

        Ok(AccountSnapshot {
            balance: field_f64(info, "balance")?,
            equity: field_f64(info, "equity").unwrap_or(field_f64(info, "balance")?),
            free_margin: field_f64(info, "margin_free")?,
            margin_level_percent: field_f64(info, "margin_level")?,
        })
    }

    #[instrument(skip(self), name = "gateway::get_positions")]
    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, GatewayError> {
        let params = match symbol {
            Some(s) => json!({ "symbol": s }),
            None => json!({}),
        };
        let body = self.call_with_retry("get_positions", params).await?;
        let raw = body
            .get("positions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GatewayError::Malformed {
                detail: "response missing 'positions' array".to_string(),
            })?;

        raw.iter().map(decode_position).collect()
    }

    #[instrument(skip(self), name = "gateway::check_spread")]
    pub async fn check_spread(&self, symbol: &str) -> Result<i64, GatewayError> {
        let body = self
            .call_with_retry("check_spread", json!({ "symbol": symbol }))
            .await?;
        body.get("spread")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| GatewayError::Malformed {
                detail: "response missing integer 'spread'".to_string(),
            })
    }

    #[instrument(skip(self), name = "gateway::calculate_volatility")]
    pub async fn calculate_volatility(
        &self,
        symbol: &str,
        timeframe: &str,
        period: u32,
    ) -> Result<f64, GatewayError> {
        let body = self
            .call_with_retry(
                "calculate_volatility",
                json!({ "symbol": symbol, "timeframe": timeframe, "period": period }),
            )
            .await?;
        field_f64(&body, "volatility")
    }

    #[instrument(skip(self), name = "gateway::get_ohlc")]
    pub async fn get_ohlc(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        let body = self
            .call_with_retry(
                "get_market_data",
                json!({ "symbol": symbol, "timeframe": timeframe, "count": count }),
            )
            .await?;
        let raw = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GatewayError::Malformed {
                detail: "response missing 'data' array".to_string(),
            })?;

        raw.iter().map(decode_candle).collect()
    }

    // -------------------------------------------------------------------------
    // Writes — never retried
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "gateway::market_order")]
    pub async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        comment: &str,
        magic: i64,
    ) -> Result<(u64, f64), GatewayError> {
        let op = match side {
            Side::Buy => "market_buy",
            Side::Sell => "market_sell",
        };
        let body = self
            .call_write(
                op,
                json!({
                    "symbol": symbol,
                    "volume": volume,
                    "sl": stop_loss,
                    "tp": take_profit,
                    "comment": comment,
                    "magic": magic,
                }),
            )
            .await?;

        let ticket = body
            .get("ticket")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GatewayError::Malformed {
                detail: "response missing 'ticket'".to_string(),
            })?;
        let price = field_f64(&body, "price")?;
        Ok((ticket, price))
    }

    #[instrument(skip(self), name = "gateway::modify_position")]
    pub async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), GatewayError> {
        let body = self
            .call_write(
                "modify_position",
                json!({ "ticket": ticket, "sl": stop_loss, "tp": take_profit }),
            )
            .await?;
        require_success(&body)
    }

    #[instrument(skip(self), name = "gateway::close_position")]
    pub async fn close_position(&self, ticket: u64, volume: Option<f64>) -> Result<f64, GatewayError> {
        let body = self
            .call_write("close_position", json!({ "ticket": ticket, "volume": volume }))
            .await?;
        require_success(&body)?;
        field_f64(&body, "profit")
    }
}

fn require_success(body: &Value) -> Result<(), GatewayError> {
    let ok = body.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(GatewayError::BrokerRejected {
            reason: body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        })
    }
}

fn field_f64(value: &Value, field: &str) -> Result<f64, GatewayError> {
    value
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| GatewayError::Malformed {
            detail: format!("missing or non-numeric field '{field}'"),
        })
}

fn decode_position(raw: &Value) -> Result<Position, GatewayError> {
    let ticket = raw
        .get("ticket")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| GatewayError::Malformed {
            detail: "position missing 'ticket'".to_string(),
        })?;
    let symbol = raw
        .get("symbol")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Malformed {
            detail: "position missing 'symbol'".to_string(),
        })?
        .to_string();
    let side = match raw.get("type").and_then(|v| v.as_str()) {
        Some("buy") => Side::Buy,
        Some("sell") => Side::Sell,
        _ => {
            return Err(GatewayError::Malformed {
                detail: "position has missing or invalid 'type'".to_string(),
            })
        }
    };
    let open_time_raw = raw.get("open_time").and_then(|v| v.as_str()).ok_or_else(|| {
        GatewayError::Malformed {
            detail: format!("position {ticket} missing broker-provided 'open_time'"),
        }
    })?;
    let open_time: DateTime<Utc> = open_time_raw.parse().map_err(|_| GatewayError::Malformed {
        detail: format!("position {ticket} has unparseable 'open_time': {open_time_raw}"),
    })?;

    Ok(Position {
        ticket,
        symbol,
        side,
        volume: field_f64(raw, "volume")?,
        open_price: field_f64(raw, "open_price")?,
        open_time,
        magic: raw.get("magic").and_then(|v| v.as_i64()).unwrap_or(0),
        comment: raw
            .get("comment")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        stop_loss: raw.get("sl").and_then(|v| v.as_f64()),
        take_profit: raw.get("tp").and_then(|v| v.as_f64()),
        current_price: field_f64(raw, "current_price")?,
        profit: field_f64(raw, "profit")?,
        group_id: None,
    })
}

fn decode_candle(raw: &Value) -> Result<Candle, GatewayError> {
    let open_time_raw = raw
        .get("open_time")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Malformed {
            detail: "candle missing 'open_time'".to_string(),
        })?;
    let open_time: DateTime<Utc> = open_time_raw.parse().map_err(|_| GatewayError::Malformed {
        detail: format!("candle has unparseable 'open_time': {open_time_raw}"),
    })?;

    Ok(Candle {
        open_time,
        open: field_f64(raw, "open")?,
        high: field_f64(raw, "high")?,
        low: field_f64(raw, "low")?,
        close: field_f64(raw, "close")?,
        volume: field_f64(raw, "volume").unwrap_or(0.0),
    })
}
