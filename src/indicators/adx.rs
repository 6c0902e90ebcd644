// =============================================================================
// ADX / DMI — directional movement family
// =============================================================================
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
// =============================================================================

use crate::market::klines::Kline;

/// (+DI, -DI) series. Both vectors share length and tail alignment.
pub fn dmi(klines: &[Kline], period: usize) -> (Vec<f64>, Vec<f64>) {
    let smoothed = smoothed_dm_tr(klines, period);
    let (plus_smooth, minus_smooth, tr_smooth) = match smoothed {
        Some(v) => v,
        None => return (Vec::new(), Vec::new()),
    };
    let mut plus_di = Vec::with_capacity(plus_smooth.len());
    let mut minus_di = Vec::with_capacity(minus_smooth.len());
    for i in 0..plus_smooth.len() {
        if tr_smooth[i].abs() < f64::EPSILON {
            plus_di.push(0.0);
            minus_di.push(0.0);
        } else {
            plus_di.push(plus_smooth[i] / tr_smooth[i] * 100.0);
            minus_di.push(minus_smooth[i] / tr_smooth[i] * 100.0);
        }
    }
    (plus_di, minus_di)
}

/// ADX series: Wilder-smoothed DX. Needs roughly `2 * period` bars before the
/// first value appears.
pub fn adx(klines: &[Kline], period: usize) -> Vec<f64> {
    let (plus_di, minus_di) = dmi(klines, period);
    if plus_di.len() < period {
        return Vec::new();
    }

    let dx: Vec<f64> = plus_di
        .iter()
        .zip(minus_di.iter())
        .map(|(p, m)| {
            let denom = p + m;
            if denom.abs() < f64::EPSILON {
                0.0
            } else {
                (p - m).abs() / denom * 100.0
            }
        })
        .collect();

    let period_f = period as f64;
    let seed: f64 = dx[..period].iter().sum::<f64>() / period_f;
    let mut out = Vec::with_capacity(dx.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &value in &dx[period..] {
        prev = (prev * (period_f - 1.0) + value) / period_f;
        out.push(prev);
    }
    out
}

/// Wilder-smoothed (+DM, -DM, TR) series shared by DI and ADX.
fn smoothed_dm_tr(klines: &[Kline], period: usize) -> Option<(Vec<f64>, Vec<f64>, Vec<f64>)> {
    if period == 0 || klines.len() < period + 1 {
        return None;
    }

    let n = klines.len() - 1;
    let mut plus_dm = Vec::with_capacity(n);
    let mut minus_dm = Vec::with_capacity(n);
    let mut tr_vals = Vec::with_capacity(n);

    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev = &klines[i - 1];

        let tr = (high - low)
            .max((high - prev.close).abs())
            .max((low - prev.close).abs());

        let up_move = high - prev.high;
        let down_move = prev.low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let period_f = period as f64;
    let mut plus_smooth = Vec::with_capacity(n - period + 1);
    let mut minus_smooth = Vec::with_capacity(n - period + 1);
    let mut tr_smooth = Vec::with_capacity(n - period + 1);

    let mut sp: f64 = plus_dm[..period].iter().sum();
    let mut sm: f64 = minus_dm[..period].iter().sum();
    let mut st: f64 = tr_vals[..period].iter().sum();
    plus_smooth.push(sp);
    minus_smooth.push(sm);
    tr_smooth.push(st);

    for i in period..n {
        sp = sp - sp / period_f + plus_dm[i];
        sm = sm - sm / period_f + minus_dm[i];
        st = st - st / period_f + tr_vals[i];
        plus_smooth.push(sp);
        minus_smooth.push(sm);
        tr_smooth.push(st);
    }

    Some((plus_smooth, minus_smooth, tr_smooth))
}
