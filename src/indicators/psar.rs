// =============================================================================
// Parabolic SAR — stop-and-reverse trail
// =============================================================================
//
// The SAR trails price by the acceleration factor `af`, which grows by its
// initial value on every new extreme point up to `max_af`:
//
//   SAR_{t+1} = SAR_t + af * (EP - SAR_t)
//
// In an uptrend SAR is clamped below the prior two lows (mirror for
// downtrends); when price crosses the SAR the trend reverses, SAR jumps to
// the old extreme point, and af resets.
// =============================================================================

use crate::market::klines::Kline;

/// PSAR series starting at the second input bar.
pub fn psar(klines: &[Kline], af_start: f64, af_max: f64) -> Vec<f64> {
    if klines.len() < 2 || af_start <= 0.0 || af_max < af_start {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(klines.len() - 1);
    let mut uptrend = klines[1].close >= klines[0].close;
    let mut sar = if uptrend { klines[0].low } else { klines[0].high };
    let mut ep = if uptrend { klines[0].high } else { klines[0].low };
    let mut af = af_start;

    for i in 1..klines.len() {
        let k = &klines[i];
        sar += af * (ep - sar);

        if uptrend {
            // SAR may not sit above the prior two lows.
            let clamp = klines[i - 1].low.min(klines[i.saturating_sub(2)].low);
            sar = sar.min(clamp);
            if k.low < sar {
                uptrend = false;
                sar = ep;
                ep = k.low;
                af = af_start;
            } else if k.high > ep {
                ep = k.high;
                af = (af + af_start).min(af_max);
            }
        } else {
            let clamp = klines[i - 1].high.max(klines[i.saturating_sub(2)].high);
            sar = sar.max(clamp);
            if k.high > sar {
                uptrend = true;
                sar = ep;
                ep = k.high;
                af = af_start;
            } else if k.low < ep {
                ep = k.low;
                af = (af + af_start).min(af_max);
            }
        }
        out.push(sar);
    }
    out
}
