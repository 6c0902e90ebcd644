// =============================================================================
// Donchian Channel — rolling high/low envelope
// =============================================================================

use crate::market::klines::Kline;

/// (upper, middle, lower) channel series over `period` bars; middle is the
/// midpoint of the envelope.
pub fn donchian(klines: &[Kline], period: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if period == 0 || klines.len() < period {
        return (Vec::new(), Vec::new(), Vec::new());
    }
    let n = klines.len() - period + 1;
    let mut upper = Vec::with_capacity(n);
    let mut middle = Vec::with_capacity(n);
    let mut lower = Vec::with_capacity(n);
    for window in klines.windows(period) {
        let high = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
        upper.push(high);
        lower.push(low);
        middle.push((high + low) / 2.0);
    }
    (upper, middle, lower)
}
