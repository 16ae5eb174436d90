// =============================================================================
// Moving Average Convergence/Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow)
// Signal    = EMA(signal) of the MACD line
// Histogram = MACD - Signal
//
// Default periods: fast=12, slow=26, signal=9.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD reading for `closes`.
///
/// Returns `None` when there is not enough history to seed both the slow
/// EMA and the signal EMA of the MACD line.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);

    // `calculate_ema` emits its first value at index `period - 1` of the
    // input, so the two series are offset by `slow - fast` before they can
    // be paired up.
    let offset = slow - fast;
    if ema_fast.len() <= offset {
        return None;
    }
    let macd_line: Vec<f64> = ema_fast[offset..]
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal {
        return None;
    }

    let signal_line = calculate_ema(&macd_line, signal);
    let macd = *macd_line.last()?;
    let sig = *signal_line.last()?;
    let histogram = macd - sig;

    if macd.is_finite() && sig.is_finite() && histogram.is_finite() {
        Some(MacdResult {
            macd,
            signal: sig,
            histogram,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn ascending_series_has_positive_histogram() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let result = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(result.macd > 0.0, "fast EMA should lead slow EMA in an uptrend");
        assert!(result.macd.is_finite());
        assert!(result.signal.is_finite());
    }

    #[test]
    fn flat_series_is_near_zero() {
        let closes = vec![100.0; 100];
        let result = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(result.macd.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }

    #[test]
    fn fast_must_be_less_than_slow() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
    }
}
