// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market::klines::Kline;

/// Full ATR series; the last element corresponds to the last input bar.
pub fn atr(klines: &[Kline], period: usize) -> Vec<f64> {
    if period == 0 || klines.len() < period + 1 {
        return Vec::new();
    }

    let mut tr_values = Vec::with_capacity(klines.len() - 1);
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut out = Vec::with_capacity(tr_values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &tr in &tr_values[period..] {
        let value = (prev * (period_f - 1.0) + tr) / period_f;
        if !value.is_finite() {
            break;
        }
        out.push(value);
        prev = value;
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(h: f64, l: f64, c: f64) -> Kline {
        Kline {
            open_time: 0,
            open: c,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            close_time: 0,
        }
    }

    #[test]
    fn insufficient_data() {
        let klines = vec![bar(105.0, 95.0, 100.0); 10];
        assert!(atr(&klines, 14).is_empty());
        assert!(atr(&klines, 0).is_empty());
    }

    #[test]
    fn constant_range_converges() {
        let klines: Vec<Kline> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base + 5.0, base - 5.0, base)
            })
            .collect();
        let series = atr(&klines, 14);
        let last = *series.last().unwrap();
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10, got {last}");
    }

    #[test]
    fn gap_inflates_true_range() {
        let mut klines = vec![bar(105.0, 95.0, 95.0)];
        klines.push(bar(115.0, 108.0, 112.0)); // gap: TR = |115-95| = 20
        klines.push(bar(118.0, 110.0, 115.0));
        klines.push(bar(120.0, 113.0, 118.0));
        let series = atr(&klines, 3);
        assert!(*series.last().unwrap() > 7.0);
    }
}
