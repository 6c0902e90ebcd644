// =============================================================================
// Ultimate Oscillator — three-window buying-pressure blend
// =============================================================================
//
//   BP = Close - min(Low, PrevClose)
//   TR = max(High, PrevClose) - min(Low, PrevClose)
//   UO = 100 * (4*avg_a + 2*avg_b + avg_c) / 7
//
// where avg_x = sum(BP, x) / sum(TR, x) over the short/medium/long windows.
// =============================================================================

use crate::market::klines::Kline;

/// Ultimate Oscillator series for windows (short, medium, long), typically
/// (7, 14, 28).
pub fn ultimate(klines: &[Kline], short: usize, medium: usize, long: usize) -> Vec<f64> {
    if short == 0 || medium == 0 || long == 0 || short > medium || medium > long {
        return Vec::new();
    }
    if klines.len() < long + 1 {
        return Vec::new();
    }

    let n = klines.len() - 1;
    let mut bp = Vec::with_capacity(n);
    let mut tr = Vec::with_capacity(n);
    for i in 1..klines.len() {
        let prev_close = klines[i - 1].close;
        let low = klines[i].low.min(prev_close);
        let high = klines[i].high.max(prev_close);
        bp.push(klines[i].close - low);
        tr.push(high - low);
    }

    let avg = |window: usize, end: usize| -> f64 {
        let start = end - window;
        let bp_sum: f64 = bp[start..end].iter().sum();
        let tr_sum: f64 = tr[start..end].iter().sum();
        if tr_sum.abs() < f64::EPSILON {
            0.5
        } else {
            bp_sum / tr_sum
        }
    };

    let mut out = Vec::with_capacity(n - long + 1);
    for end in long..=n {
        let value =
            100.0 * (4.0 * avg(short, end) + 2.0 * avg(medium, end) + avg(long, end)) / 7.0;
        out.push(value);
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
    fn rejects_bad_windows() {
        let klines = vec![bar(101.0, 99.0, 100.0); 40];
        assert!(ultimate(&klines, 14, 7, 28).is_empty());
        assert!(ultimate(&klines, 0, 14, 28).is_empty());
        assert!(ultimate(&klines[..10], 7, 14, 28).is_empty());
    }

    #[test]
    fn bounded_zero_to_hundred() {
        let klines: Vec<Kline> = (0..80)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.4).sin() * 4.0;
                bar(base + 1.5, base - 1.5, base)
            })
            .collect();
        let out = ultimate(&klines, 7, 14, 28);
        assert!(!out.is_empty());
        for &v in &out {
            assert!((0.0..=100.0).contains(&v), "{v} out of range");
        }
    }

    #[test]
    fn strong_buying_pressure_reads_high() {
        // Closes pinned at the high of each bar.
        let klines: Vec<Kline> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base + 2.0, base - 2.0, base + 2.0)
            })
            .collect();
        let out = ultimate(&klines, 7, 14, 28);
        assert!(*out.last().unwrap() > 70.0);
    }
}
