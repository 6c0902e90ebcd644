// =============================================================================
// Bollinger Bands — SMA middle band with standard-deviation envelopes
// =============================================================================

/// Full band series: (upper, middle, lower), each trimmed to the warmed-up
/// region. `middle` is the `period`-SMA; the envelopes sit `num_std`
/// population standard deviations away.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if period == 0 || closes.len() < period {
        return (Vec::new(), Vec::new(), Vec::new());
    }
    let n = closes.len() - period + 1;
    let mut upper = Vec::with_capacity(n);
    let mut middle = Vec::with_capacity(n);
    let mut lower = Vec::with_capacity(n);

    for window in closes.windows(period) {
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();
        upper.push(mean + num_std * std_dev);
        middle.push(mean);
        lower.push(mean - num_std * std_dev);
    }
    (upper, middle, lower)
}
