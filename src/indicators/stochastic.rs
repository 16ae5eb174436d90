// =============================================================================
// Stochastic Oscillator
// =============================================================================
//
// %K = 100 * (close - lowest_low(period)) / (highest_high(period) - lowest_low(period))
// %D = SMA(%K, slowing)
//
// Default: period=14, slowing=3.
// =============================================================================

use crate::types::Candle;

#[derive(Debug, Clone, Copy)]
pub struct StochasticResult {
    pub k: f64,
    pub d: f64,
}

/// Compute the most recent %K/%D reading from a slice of OHLC candles.
///
/// Returns `None` when there are fewer than `period + slowing - 1` candles,
/// or when the period's range collapses to zero (flat market — %K is
/// undefined rather than reported as a spurious 0 or 100).
pub fn calculate_stochastic(candles: &[Candle], period: usize, slowing: usize) -> Option<StochasticResult> {
    if period == 0 || slowing == 0 {
        return None;
    }
    if candles.len() < period + slowing - 1 {
        return None;
    }

    let mut k_values = Vec::with_capacity(slowing);
    for end in (candles.len() - slowing + 1)..=candles.len() {
        let window = &candles[end - period..end];
        let highest_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let range = highest_high - lowest_low;
        if range == 0.0 {
            return None;
        }
        let close = window.last()?.close;
        let k = 100.0 * (close - lowest_low) / range;
        if !k.is_finite() {
            return None;
        }
        k_values.push(k);
    }

    let d = k_values.iter().sum::<f64>() / k_values.len() as f64;
    let k = *k_values.last()?;

    Some(StochasticResult { k, d })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn insufficient_data_returns_none() {
        let candles = vec![candle(101.0, 99.0, 100.0); 5];
        assert!(calculate_stochastic(&candles, 14, 3).is_none());
    }

    #[test]
    fn close_at_high_gives_k_near_100() {
        let mut candles = vec![candle(100.0, 90.0, 95.0); 13];
        candles.push(candle(110.0, 90.0, 110.0));
        let result = calculate_stochastic(&candles, 14, 1).unwrap();
        assert!((result.k - 100.0).abs() < 1e-9);
    }

    #[test]
    fn close_at_low_gives_k_near_zero() {
        let mut candles = vec![candle(110.0, 90.0, 100.0); 13];
        candles.push(candle(110.0, 80.0, 80.0));
        let result = calculate_stochastic(&candles, 14, 1).unwrap();
        assert!(result.k.abs() < 1e-9);
    }

    #[test]
    fn flat_range_returns_none() {
        let candles = vec![candle(100.0, 100.0, 100.0); 20];
        assert!(calculate_stochastic(&candles, 14, 3).is_none());
    }
}
