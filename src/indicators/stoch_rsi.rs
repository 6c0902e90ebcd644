// =============================================================================
// Stochastic RSI — stochastic oscillator applied to the RSI series
// =============================================================================
//
//   StochRSI = (RSI - min(RSI, n)) / (max(RSI, n) - min(RSI, n)) * 100
//
// %K is the `smooth_k`-SMA of the raw stochastic, %D the `smooth_d`-SMA of
// %K. A flat RSI window (max == min) yields a neutral 50.
// =============================================================================

use super::ma::sma;
use super::rsi::rsi;

/// (%K, %D) series for the given closes.
pub fn stoch_rsi(
    closes: &[f64],
    length: usize,
    smooth_k: usize,
    smooth_d: usize,
) -> (Vec<f64>, Vec<f64>) {
    let rsi_series = rsi(closes, length);
    if length == 0 || rsi_series.len() < length {
        return (Vec::new(), Vec::new());
    }

    let mut raw = Vec::with_capacity(rsi_series.len() - length + 1);
    for window in rsi_series.windows(length) {
        let max = window.iter().cloned().fold(f64::MIN, f64::max);
        let min = window.iter().cloned().fold(f64::MAX, f64::min);
        let value = if (max - min).abs() < f64::EPSILON {
            50.0
        } else {
            (window[window.len() - 1] - min) / (max - min) * 100.0
        };
        raw.push(value);
    }

    let k = sma(&raw, smooth_k.max(1));
    let d = sma(&k, smooth_d.max(1));
    (k, d)
}
