// =============================================================================
// MACD — Moving Average Convergence/Divergence
// =============================================================================
//
//   line   = EMA(fast) - EMA(slow)
//   signal = EMA(line, signal_period)
//   hist   = line - signal
// =============================================================================

use super::ma::ema;

/// (line, signal, histogram) series, aligned at their tails.
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return (Vec::new(), Vec::new(), Vec::new());
    }
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);
    if ema_slow.is_empty() {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    // Align the two EMAs at the tail: the slow EMA is the shorter series.
    let offset = ema_fast.len() - ema_slow.len();
    let line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, s)| ema_fast[i + offset] - s)
        .collect();

    let signal = ema(&line, signal_period);
    if signal.is_empty() {
        return (line, Vec::new(), Vec::new());
    }
    let offset = line.len() - signal.len();
    let hist: Vec<f64> = signal
        .iter()
        .enumerate()
        .map(|(i, s)| line[i + offset] - s)
        .collect();

    (line, signal, hist)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_periods() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let (l, s, h) = macd(&closes, 26, 12, 9);
        assert!(l.is_empty() && s.is_empty() && h.is_empty());
        let (l, _, _) = macd(&closes, 0, 26, 9);
        assert!(l.is_empty());
    }

    #[test]
    fn flat_series_is_zero() {
        let closes = vec![100.0; 80];
        let (line, signal, hist) = macd(&closes, 12, 26, 9);
        assert!(!hist.is_empty());
        for &v in line.iter().chain(signal.iter()).chain(hist.iter()) {
            assert!(v.abs() < 1e-9);
        }
    }

    #[test]
    fn uptrend_has_positive_line() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let (line, _, _) = macd(&closes, 12, 26, 9);
        assert!(*line.last().unwrap() > 0.0);
    }

    #[test]
    fn series_lengths_align() {
        let closes: Vec<f64> = (0..90).map(|i| 100.0 + (i as f64 * 0.2).sin()).collect();
        let (line, signal, hist) = macd(&closes, 12, 26, 9);
        assert_eq!(signal.len(), hist.len());
        assert!(line.len() >= signal.len());
    }
}
