// =============================================================================
// Average Directional Index field — reported as DX of the trailing window
// =============================================================================
//
// Quantifies trend strength regardless of direction.
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX = |+DI - -DI| / (+DI + -DI) * 100
//
// This engine reports the DX computed at the end of the trailing window
// directly, rather than further Wilder-smoothing DX itself into a classic
// ADX average — see the scaling-level and ADX decisions recorded in the
// design ledger. The field is still called ADX in the snapshot because
// that's the name consumers expect; its value is DX.
//
// Interpretation:
//   > 25  => trending market
//   < 20  => ranging / choppy market
// =============================================================================

use crate::types::Candle;

/// Compute the most recent ADX-field (DX) value from a slice of OHLC
/// candles.
///
/// Returns `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` candles (we need `period` bar-to-bar
///   transitions to seed the Wilder smoothing of +DM/-DM/TR).
/// - Any intermediate calculation produces a non-finite result.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }

    let min_candles = period + 1;
    if candles.len() < min_candles {
        return None;
    }

    let n = candles.len();
    let bar_count = n - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        let pdm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let mdm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        plus_dm.push(pdm);
        minus_dm.push(mdm);
        tr_vals.push(tr);
    }

    // Seed Wilder's smoothing with the sum of the first `period` values,
    // then roll forward to the most recent bar.
    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    for i in period..bar_count {
        smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period as f64 + plus_dm[i];
        smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period as f64 + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period as f64 + tr_vals[i];
    }

    compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr)
}

/// Compute DX from smoothed +DM, -DM, and TR values.
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;

    if dx.is_finite() {
        Some(dx)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn adx_period_zero() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 50];
        assert!(calculate_adx(&candles, 0).is_none());
    }

    #[test]
    fn adx_insufficient_data() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 10];
        assert!(calculate_adx(&candles, 14).is_none());
    }

    #[test]
    fn adx_strong_uptrend() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();

        let adx = calculate_adx(&candles, 14);
        assert!(adx.is_some());
        let value = adx.unwrap();
        assert!(value > 25.0, "expected ADX-field > 25 for strong trend, got {value}");
    }

    #[test]
    fn adx_flat_market() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 30];
        let adx = calculate_adx(&candles, 14);
        assert!(adx.is_some());
        assert!(adx.unwrap() < 1.0);
    }

    #[test]
    fn adx_result_range() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(value) = calculate_adx(&candles, 14) {
            assert!((0.0..=100.0).contains(&value), "ADX-field {value} out of [0,100] range");
        }
    }

    #[test]
    fn adx_minimum_candles_exact() {
        let period = 5;
        let min = period + 1;
        let candles: Vec<Candle> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(calculate_adx(&candles, period).is_some());
        assert!(calculate_adx(&candles[..min - 1], period).is_none());
    }
}
