// =============================================================================
// Stochastic Oscillator — %K / %D over OHLC bars
// =============================================================================
//
//   raw %K = (Close - LowestLow(n)) / (HighestHigh(n) - LowestLow(n)) * 100
//   %K     = SMA(raw, smooth_k)
//   %D     = SMA(%K, smooth_d)
// =============================================================================

use super::ma::sma;
use crate::market::klines::Kline;

/// (%K, %D) series over `length` bars.
pub fn stochastic(
    klines: &[Kline],
    length: usize,
    smooth_k: usize,
    smooth_d: usize,
) -> (Vec<f64>, Vec<f64>) {
    if length == 0 || klines.len() < length {
        return (Vec::new(), Vec::new());
    }
    let mut raw = Vec::with_capacity(klines.len() - length + 1);
    for window in klines.windows(length) {
        let highest = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
        let close = window[window.len() - 1].close;
        let range = highest - lowest;
        let value = if range.abs() < f64::EPSILON {
            50.0
        } else {
            (close - lowest) / range * 100.0
        };
        raw.push(value);
    }
    let k = sma(&raw, smooth_k.max(1));
    let d = sma(&k, smooth_d.max(1));
    (k, d)
}
