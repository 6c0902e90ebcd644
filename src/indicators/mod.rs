// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator math. Every function takes plain slices
// and returns trimmed series: warmup bars are omitted and the final element
// always corresponds to the final input bar, so consumers can read
// (prev, live) off the tail without index bookkeeping. An empty series means
// "not yet warmed up".
//
// `compute` evaluates every enabled indicator from the config into a flat
// name -> series map, mirroring how the signal generator consumes them.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod donchian;
pub mod ma;
pub mod macd;
pub mod psar;
pub mod rsi;
pub mod stoch_rsi;
pub mod stochastic;
pub mod supertrend;
pub mod ultimate;
pub mod willr;

use std::collections::BTreeMap;

use crate::config::IndicatorConfig;
use crate::market::klines::{closes, Kline};

/// Named indicator series, e.g. "rsi", "stoch_rsi_k", "bb_upper".
pub type SeriesMap = BTreeMap<String, Vec<f64>>;

fn len_of(cfg: &IndicatorConfig, default: u32) -> usize {
    cfg.length.unwrap_or(default).max(1) as usize
}

/// Evaluate every enabled indicator over `klines`.
pub fn compute(klines: &[Kline], indicators: &BTreeMap<String, IndicatorConfig>) -> SeriesMap {
    let mut out = SeriesMap::new();
    let close_col = closes(klines);

    for (key, cfg) in indicators {
        if !cfg.enabled {
            continue;
        }
        match key.as_str() {
            "rsi" => {
                out.insert("rsi".into(), rsi::rsi(&close_col, len_of(cfg, 14)));
            }
            "ma" => {
                out.insert("ma".into(), ma::sma(&close_col, len_of(cfg, 20)));
            }
            "ema" => {
                out.insert("ema".into(), ma::ema(&close_col, len_of(cfg, 20)));
            }
            "bb" => {
                let (upper, mid, lower) = bollinger::bollinger(
                    &close_col,
                    len_of(cfg, 20),
                    cfg.std_mult.unwrap_or(2.0),
                );
                out.insert("bb_upper".into(), upper);
                out.insert("bb_mid".into(), mid);
                out.insert("bb_lower".into(), lower);
            }
            "stoch_rsi" => {
                let (k, d) = stoch_rsi::stoch_rsi(
                    &close_col,
                    len_of(cfg, 14),
                    cfg.k.unwrap_or(3).max(1) as usize,
                    cfg.d.unwrap_or(3).max(1) as usize,
                );
                out.insert("stoch_rsi_k".into(), k);
                out.insert("stoch_rsi_d".into(), d);
            }
            "willr" => {
                out.insert("willr".into(), willr::willr(klines, len_of(cfg, 14)));
            }
            "macd" => {
                let (line, signal, hist) = macd::macd(
                    &close_col,
                    cfg.fast.unwrap_or(12).max(1) as usize,
                    cfg.slow.unwrap_or(26).max(1) as usize,
                    cfg.signal.unwrap_or(9).max(1) as usize,
                );
                out.insert("macd_line".into(), line);
                out.insert("macd_signal".into(), signal);
                out.insert("macd_hist".into(), hist);
            }
            "uo" => {
                out.insert(
                    "uo".into(),
                    ultimate::ultimate(
                        klines,
                        cfg.a.unwrap_or(7).max(1) as usize,
                        cfg.b.unwrap_or(14).max(1) as usize,
                        cfg.c.unwrap_or(28).max(1) as usize,
                    ),
                );
            }
            "adx" => {
                out.insert("adx".into(), adx::adx(klines, len_of(cfg, 14)));
            }
            "dmi" => {
                let (plus, minus) = adx::dmi(klines, len_of(cfg, 14));
                let diff: Vec<f64> = plus.iter().zip(minus.iter()).map(|(p, m)| p - m).collect();
                out.insert("dmi_plus".into(), plus);
                out.insert("dmi_minus".into(), minus);
                out.insert("dmi".into(), diff);
            }
            "supertrend" => {
                out.insert(
                    "supertrend".into(),
                    supertrend::supertrend(
                        klines,
                        cfg.atr_length.unwrap_or(10).max(1) as usize,
                        cfg.multiplier.unwrap_or(3.0),
                    ),
                );
            }
            "stochastic" => {
                let (k, d) = stochastic::stochastic(
                    klines,
                    len_of(cfg, 14),
                    cfg.k.unwrap_or(3).max(1) as usize,
                    cfg.d.unwrap_or(3).max(1) as usize,
                );
                out.insert("stochastic_k".into(), k);
                out.insert("stochastic_d".into(), d);
            }
            "psar" => {
                out.insert(
                    "psar".into(),
                    psar::psar(klines, cfg.af.unwrap_or(0.02), cfg.max_af.unwrap_or(0.2)),
                );
            }
            "donchian" => {
                let (upper, mid, lower) = donchian::donchian(klines, len_of(cfg, 20));
                out.insert("donchian_upper".into(), upper);
                out.insert("donchian_mid".into(), mid);
                out.insert("donchian_lower".into(), lower);
            }
            other => {
                tracing::debug!(indicator = other, "unknown indicator key ignored");
            }
        }
    }
    out
}
