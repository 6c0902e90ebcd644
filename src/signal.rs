// =============================================================================
// Signal Generator — per-indicator threshold and crossing evaluation
// =============================================================================
//
// Each enabled indicator contributes at most one action per evaluation:
//
//   * Threshold indicators (RSI, StochRSI, Williams %R, Stochastic, UO,
//     MACD histogram, DMI spread, ADX): with buy_value <= sell_value the
//     indicator is an oscillator — BUY at or below buy_value, SELL at or
//     above sell_value. With buy_value > sell_value the polarity inverts
//     (trend-strength style thresholds).
//   * Crossing indicators (MA, EMA, Supertrend, PSAR, Donchian midline):
//     BUY when the close crosses above the line (prev_close < prev_line and
//     last_close > last_line), SELL on the mirror cross.
//
// The evaluated value is the live (still-forming) bar when
// `indicator_use_live_values` is set, otherwise the last closed bar.
// Bollinger bands contribute context to the trigger description only.
// =============================================================================

use std::collections::BTreeMap;

use crate::config::BotConfig;
use crate::indicators::SeriesMap;
use crate::market::klines::Kline;
use crate::types::Side;

/// Indicator evaluation order: mirrors the priority the engine has always
/// used, RSI first.
const EVAL_ORDER: &[&str] = &[
    "rsi",
    "stoch_rsi",
    "willr",
    "ma",
    "ema",
    "macd",
    "uo",
    "adx",
    "dmi",
    "supertrend",
    "stochastic",
    "psar",
    "donchian",
];

fn display_name(key: &str) -> &'static str {
    match key {
        "rsi" => "RSI",
        "stoch_rsi" => "StochRSI %K",
        "willr" => "Williams %R",
        "ma" => "MA",
        "ema" => "EMA",
        "macd" => "MACD hist",
        "uo" => "UO",
        "adx" => "ADX",
        "dmi" => "DMI",
        "supertrend" => "Supertrend",
        "stochastic" => "Stochastic %K",
        "psar" => "PSAR",
        "donchian" => "Donchian",
        _ => "?",
    }
}

/// Which series a threshold indicator reads.
fn threshold_series_key(key: &str) -> Option<&'static str> {
    match key {
        "rsi" => Some("rsi"),
        "stoch_rsi" => Some("stoch_rsi_k"),
        "willr" => Some("willr"),
        "macd" => Some("macd_hist"),
        "uo" => Some("uo"),
        "adx" => Some("adx"),
        "dmi" => Some("dmi"),
        "stochastic" => Some("stochastic_k"),
        _ => None,
    }
}

/// Which series a crossing indicator reads as its line.
fn crossing_series_key(key: &str) -> Option<&'static str> {
    match key {
        "ma" => Some("ma"),
        "ema" => Some("ema"),
        "supertrend" => Some("supertrend"),
        "psar" => Some("psar"),
        "donchian" => Some("donchian_mid"),
        _ => None,
    }
}

fn default_thresholds(key: &str) -> (f64, f64) {
    match key {
        "rsi" => (30.0, 70.0),
        "stoch_rsi" | "stochastic" => (20.0, 80.0),
        "willr" => (-80.0, -20.0),
        "uo" => (30.0, 70.0),
        "macd" | "dmi" => (0.0, 0.0),
        "adx" => (25.0, 25.0),
        _ => (0.0, 0.0),
    }
}

/// Everything one evaluation produced.
#[derive(Debug, Clone, Default)]
pub struct SignalReport {
    /// First action in evaluation order; the pipeline opens this side.
    pub primary: Option<Side>,
    /// indicator -> action for every indicator that fired.
    pub actions: BTreeMap<String, Side>,
    /// Evaluation order of the fired indicators.
    pub sources: Vec<String>,
    pub trigger_desc: String,
    pub trigger_price: Option<f64>,
}

/// (prev, live, chosen) off the series tail. `None` until two values exist.
pub fn prev_live_chosen(series: &[f64], use_live: bool) -> Option<(f64, f64, f64)> {
    if series.len() < 2 {
        return None;
    }
    let prev = series[series.len() - 2];
    let live = series[series.len() - 1];
    if !prev.is_finite() || !live.is_finite() {
        return None;
    }
    Some((prev, live, if use_live { live } else { prev }))
}

/// Evaluate every enabled indicator and assemble the report.
pub fn generate(klines: &[Kline], series: &SeriesMap, cfg: &BotConfig) -> SignalReport {
    let mut report = SignalReport::default();
    if klines.len() < 2 {
        report.trigger_desc = "no data".to_string();
        return report;
    }
    let last_close = klines[klines.len() - 1].close;
    let prev_close = klines[klines.len() - 2].close;
    let use_live = cfg.indicator_use_live_values;

    let mut desc: Vec<String> = Vec::new();
    let buy_allowed = cfg.side.allows(Side::Buy);
    let sell_allowed = cfg.side.allows(Side::Sell);

    for &key in EVAL_ORDER {
        let icfg = match cfg.indicators.get(key) {
            Some(c) if c.enabled => c,
            _ => continue,
        };
        let label = display_name(key);

        if let Some(series_key) = threshold_series_key(key) {
            let values = match series.get(series_key) {
                Some(v) => v,
                None => continue,
            };
            let (prev, live, chosen) = match prev_live_chosen(values, use_live) {
                Some(v) => v,
                None => {
                    desc.push(format!("{label} warming up"));
                    continue;
                }
            };
            desc.push(format!("{label}={chosen:.2} (prev={prev:.2}, live={live:.2})"));

            let defaults = default_thresholds(key);
            let buy_th = icfg.buy_value.unwrap_or(defaults.0);
            let sell_th = icfg.sell_value.unwrap_or(defaults.1);
            let oscillator = buy_th <= sell_th;

            let action = if oscillator {
                if buy_allowed && chosen <= buy_th {
                    desc.push(format!("{label} <= {buy_th:.2} -> BUY"));
                    Some(Side::Buy)
                } else if sell_allowed && chosen >= sell_th {
                    desc.push(format!("{label} >= {sell_th:.2} -> SELL"));
                    Some(Side::Sell)
                } else {
                    None
                }
            } else if buy_allowed && chosen >= buy_th {
                desc.push(format!("{label} >= {buy_th:.2} -> BUY"));
                Some(Side::Buy)
            } else if sell_allowed && chosen <= sell_th {
                desc.push(format!("{label} <= {sell_th:.2} -> SELL"));
                Some(Side::Sell)
            } else {
                None
            };

            if let Some(side) = action {
                record(&mut report, key, side);
            }
        } else if let Some(series_key) = crossing_series_key(key) {
            let line = match series.get(series_key) {
                Some(v) if v.len() >= 2 => v,
                _ => continue,
            };
            let prev_line = line[line.len() - 2];
            let last_line = line[line.len() - 1];
            if !prev_line.is_finite() || !last_line.is_finite() {
                continue;
            }
            desc.push(format!("{label}_prev={prev_line:.8},{label}_last={last_line:.8}"));

            if buy_allowed && prev_close < prev_line && last_close > last_line {
                desc.push(format!("{label} crossover -> BUY"));
                record(&mut report, key, Side::Buy);
            } else if sell_allowed && prev_close > prev_line && last_close < last_line {
                desc.push(format!("{label} crossover -> SELL"));
                record(&mut report, key, Side::Sell);
            }
        }
    }

    // Bollinger context, informational only.
    if let (Some(bu), Some(bm), Some(bl)) = (
        series.get("bb_upper").and_then(|s| s.last()),
        series.get("bb_mid").and_then(|s| s.last()),
        series.get("bb_lower").and_then(|s| s.last()),
    ) {
        desc.push(format!("BB_up={bu:.8},BB_mid={bm:.8},BB_low={bl:.8}"));
    }

    if desc.is_empty() {
        desc.push("No triggers evaluated".to_string());
    }
    report.trigger_desc = desc.join(" | ");
    report.trigger_price = report.primary.map(|_| last_close);
    report
}

fn record(report: &mut SignalReport, key: &str, side: Side) {
    report.actions.insert(key.to_string(), side);
    report.sources.push(key.to_string());
    if report.primary.is_none() {
        report.primary = Some(side);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicatorConfig;
    use crate::types::SideFilter;

    fn bars(prev_close: f64, last_close: f64) -> Vec<Kline> {
        [prev_close, last_close]
            .iter()
            .enumerate()
            .map(|(i, &c)| Kline {
                open_time: i as i64 * 60_000,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1.0,
                close_time: i as i64 * 60_000 + 59_999,
            })
            .collect()
    }

    fn rsi_cfg(use_live: bool) -> BotConfig {
        let mut cfg = BotConfig::default();
        cfg.indicator_use_live_values = use_live;
        cfg.indicators.clear();
        cfg.indicators.insert(
            "rsi".to_string(),
            IndicatorConfig::enabled_with_length(14, 30.0, 70.0),
        );
        cfg
    }

    #[test]
    fn rsi_buy_on_live_value() {
        let mut series = SeriesMap::new();
        series.insert("rsi".to_string(), vec![35.0, 28.4]);
        let report = generate(&bars(20_010.0, 20_000.0), &series, &rsi_cfg(true));
        assert_eq!(report.primary, Some(Side::Buy));
        assert_eq!(report.actions["rsi"], Side::Buy);
        assert_eq!(report.trigger_price, Some(20_000.0));
        assert!(report.trigger_desc.contains("RSI"));
    }

    #[test]
    fn rsi_prev_value_selected_by_default() {
        let mut series = SeriesMap::new();
        // prev 35 (neutral), live 28.4 (oversold): default uses prev -> no
        // action yet.
        series.insert("rsi".to_string(), vec![35.0, 28.4]);
        let report = generate(&bars(20_010.0, 20_000.0), &series, &rsi_cfg(false));
        assert_eq!(report.primary, None);
    }

    #[test]
    fn rsi_sell_blocked_by_side_filter() {
        let mut cfg = rsi_cfg(true);
        cfg.side = SideFilter::Buy;
        let mut series = SeriesMap::new();
        series.insert("rsi".to_string(), vec![75.0, 80.0]);
        let report = generate(&bars(20_000.0, 20_100.0), &series, &cfg);
        assert_eq!(report.primary, None);
    }

    #[test]
    fn ma_crossover_buy() {
        let mut cfg = BotConfig::default();
        cfg.indicators.clear();
        cfg.indicators.insert(
            "ma".to_string(),
            IndicatorConfig::enabled_with_length(20, 0.0, 0.0),
        );
        let mut series = SeriesMap::new();
        // prev close 99 below prev MA 100; last close 102 above last MA 100.5.
        series.insert("ma".to_string(), vec![100.0, 100.5]);
        let report = generate(&bars(99.0, 102.0), &series, &cfg);
        assert_eq!(report.primary, Some(Side::Buy));
        assert!(report.trigger_desc.contains("crossover"));
    }

    #[test]
    fn ma_no_signal_without_cross() {
        let mut cfg = BotConfig::default();
        cfg.indicators.clear();
        cfg.indicators.insert(
            "ma".to_string(),
            IndicatorConfig::enabled_with_length(20, 0.0, 0.0),
        );
        let mut series = SeriesMap::new();
        series.insert("ma".to_string(), vec![100.0, 100.5]);
        // Already above on both bars: no cross.
        let report = generate(&bars(101.0, 102.0), &series, &cfg);
        assert_eq!(report.primary, None);
    }

    #[test]
    fn first_indicator_wins_primary() {
        let mut cfg = rsi_cfg(true);
        cfg.indicators.insert(
            "stoch_rsi".to_string(),
            IndicatorConfig::enabled_with_length(14, 20.0, 80.0),
        );
        let mut series = SeriesMap::new();
        series.insert("rsi".to_string(), vec![28.0, 25.0]);
        series.insert("stoch_rsi_k".to_string(), vec![95.0, 96.0]);
        let report = generate(&bars(20_010.0, 20_000.0), &series, &cfg);
        // RSI fires BUY first; StochRSI SELL is recorded but not primary.
        assert_eq!(report.primary, Some(Side::Buy));
        assert_eq!(report.actions["stoch_rsi"], Side::Sell);
        assert_eq!(report.sources, vec!["rsi", "stoch_rsi"]);
    }

    #[test]
    fn warming_up_series_skipped() {
        let mut series = SeriesMap::new();
        series.insert("rsi".to_string(), vec![28.0]);
        let report = generate(&bars(20_010.0, 20_000.0), &series, &rsi_cfg(true));
        assert_eq!(report.primary, None);
        assert!(report.trigger_desc.contains("warming up"));
    }

    #[test]
    fn no_data_short_circuit() {
        let report = generate(&[], &SeriesMap::new(), &rsi_cfg(true));
        assert_eq!(report.trigger_desc, "no data");
    }
}
