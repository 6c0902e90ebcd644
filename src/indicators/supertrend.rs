// =============================================================================
// Supertrend — ATR-banded trend line
// =============================================================================
//
//   basic_upper = (H + L) / 2 + mult * ATR
//   basic_lower = (H + L) / 2 - mult * ATR
//
// The final bands ratchet: an upper band may only move down while price
// closes below it, a lower band only up while price closes above it. The
// supertrend line flips between the two when price crosses the active band;
// price above the line means uptrend.
// =============================================================================

use super::atr::atr;
use crate::market::klines::Kline;

/// Supertrend line series, tail-aligned with the input.
pub fn supertrend(klines: &[Kline], atr_period: usize, multiplier: f64) -> Vec<f64> {
    let atr_series = atr(klines, atr_period);
    if atr_series.is_empty() {
        return Vec::new();
    }
    let offset = klines.len() - atr_series.len();

    let mut line = Vec::with_capacity(atr_series.len());
    let mut final_upper = f64::MAX;
    let mut final_lower = f64::MIN;
    let mut uptrend = true;

    for (i, &atr_val) in atr_series.iter().enumerate() {
        let k = &klines[offset + i];
        let mid = (k.high + k.low) / 2.0;
        let basic_upper = mid + multiplier * atr_val;
        let basic_lower = mid - multiplier * atr_val;
        let prev_close = if offset + i > 0 {
            klines[offset + i - 1].close
        } else {
            k.close
        };

        // Band ratchet.
        final_upper = if basic_upper < final_upper || prev_close > final_upper {
            basic_upper
        } else {
            final_upper
        };
        final_lower = if basic_lower > final_lower || prev_close < final_lower {
            basic_lower
        } else {
            final_lower
        };

        uptrend = if uptrend {
            k.close >= final_lower
        } else {
            k.close > final_upper
        };

        line.push(if uptrend { final_lower } else { final_upper });
    }
    line
}
