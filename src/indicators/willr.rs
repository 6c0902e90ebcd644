// =============================================================================
// Williams %R — momentum oscillator in [-100, 0]
// =============================================================================
//
//   %R = (HighestHigh(n) - Close) / (HighestHigh(n) - LowestLow(n)) * -100
// =============================================================================

use crate::market::klines::Kline;

/// Williams %R series over `period` bars. A degenerate window (flat range)
/// reads -50.
pub fn willr(klines: &[Kline], period: usize) -> Vec<f64> {
    if period == 0 || klines.len() < period {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(klines.len() - period + 1);
    for window in klines.windows(period) {
        let highest = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
        let close = window[window.len() - 1].close;
        let range = highest - lowest;
        let value = if range.abs() < f64::EPSILON {
            -50.0
        } else {
            (highest - close) / range * -100.0
        };
        out.push(value);
    }
    out
}
